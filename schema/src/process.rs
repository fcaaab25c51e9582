//! Process launch options, exit statuses and run results
//!
//! ## Stdio
//!
//! Each of the three standard streams can be piped back to the supervising
//! process, inherited from it, or redirected to the null device. Piped
//! streams are the only ones whose content is delivered through callbacks
//! or collected into a [`ProcessResult`].
//!
//! ## Exit status encoding
//!
//! [`ExitStatus`] preserves the difference between a normal exit and a
//! termination by signal. Its integer form ([`ExitStatus::code`]) is the
//! exit code for normal exits and the negated signal number otherwise, so
//! `-9` means "killed by SIGKILL" and never collapses into a generic failure.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// How a standard stream of the child is connected
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum StdioMode {
    /// Connect the stream to a pipe owned by the supervisor
    #[default]
    Pipe,
    /// Share the parent's stream
    Inherit,
    /// Connect the stream to the null device
    Null,
}

/// Whether the child starts from the parent's environment or an empty one
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum EnvironmentMode {
    /// Start from the parent's environment and apply overrides on top
    #[default]
    Inherit,
    /// Start from an empty environment containing only the overrides
    Clear,
}

/// Options controlling how a child process is launched
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOptions {
    /// Working directory for the child; the parent's when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,

    /// Environment variables to set for the child
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Whether the parent's environment is inherited
    #[serde(default)]
    pub environment_mode: EnvironmentMode,

    /// Connection of the child's standard input
    #[serde(default)]
    pub stdin: StdioMode,

    /// Connection of the child's standard output
    #[serde(default)]
    pub stdout: StdioMode,

    /// Connection of the child's standard error
    #[serde(default)]
    pub stderr: StdioMode,

    /// Place the child in a new session and process group so termination
    /// signals reach every process it spawns
    #[serde(default = "default_detach_process_group")]
    pub detach_process_group: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            working_directory: None,
            environment: HashMap::new(),
            environment_mode: EnvironmentMode::default(),
            stdin: StdioMode::default(),
            stdout: StdioMode::default(),
            stderr: StdioMode::default(),
            detach_process_group: default_detach_process_group(),
        }
    }
}

impl ProcessOptions {
    /// Set the working directory
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Add an environment override
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

const fn default_detach_process_group() -> bool {
    true
}

/// How a child process terminated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ExitStatus {
    /// The process exited normally with the given code
    Exited {
        /// Exit code passed to `exit()`
        code: i32,
    },
    /// The process was terminated by a signal (Unix only)
    Signaled {
        /// Signal number
        signal: i32,
    },
}

impl ExitStatus {
    /// Integer form of the status: the exit code, or the negated signal number
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited { code } => *code,
            ExitStatus::Signaled { signal } => -signal,
        }
    }

    /// Whether the process exited normally with code 0
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited { code: 0 })
    }

    /// Signal that terminated the process, if any
    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitStatus::Signaled { signal } => Some(*signal),
            ExitStatus::Exited { .. } => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited { code } => write!(f, "exit code {}", code),
            ExitStatus::Signaled { signal } => write!(f, "signal {}", signal),
        }
    }
}

/// Output of a process that was run to completion
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResult {
    /// Exit status in integer form (see [`ExitStatus::code`])
    pub exit_status: i32,
    /// Everything the process wrote to standard output
    pub std_out: String,
    /// Everything the process wrote to standard error
    pub std_err: String,
}

impl ProcessResult {
    /// Whether the process exited with code 0
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// A program entry in a supervision file
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgramSpec {
    /// Label used to prefix output and events
    pub name: String,

    /// Executable to launch, or a shell command line when `shell` is set
    pub command: String,

    /// Command-line arguments (ignored for shell commands)
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,

    /// Text written to the program's standard input, which is then closed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    /// Run `command` through `/bin/sh -c`
    #[serde(default)]
    pub shell: bool,
}

impl ProgramSpec {
    /// Launch options derived from this entry
    pub fn options(&self) -> ProcessOptions {
        ProcessOptions {
            working_directory: self.working_directory.clone(),
            environment: self.environment.clone(),
            ..ProcessOptions::default()
        }
    }
}
