//! Process lifecycle events
//!
//! Events are emitted by front ends that observe a supervisor (for example the
//! `chaperone supervise --json` command) and are designed to be serialized as
//! one JSON object per line.

use crate::process::ExitStatus;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Standard stream identifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl OutputStream {
    /// Short lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Events describing one supervised program
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "eventType", rename_all = "camelCase")]
pub enum ProcessEvent {
    /// The program was launched
    Started {
        /// Program label
        name: String,
        /// Process ID
        pid: u32,
        /// Executable or shell command line
        command: String,
        /// Arguments passed to the executable
        args: Vec<String>,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// The program could not be launched
    SpawnFailed {
        /// Program label
        name: String,
        /// Error description
        error: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// The program produced output
    Output {
        /// Program label
        name: String,
        /// Process ID
        pid: u32,
        /// Stream the output was read from
        stream: OutputStream,
        /// Output text
        content: String,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },

    /// The program exited
    Exited {
        /// Program label
        name: String,
        /// Process ID
        pid: u32,
        /// How the program terminated
        status: ExitStatus,
        /// Event timestamp in RFC3339 format
        timestamp: String,
    },
}

impl ProcessEvent {
    /// Program label the event refers to
    pub fn name(&self) -> &str {
        match self {
            Self::Started { name, .. }
            | Self::SpawnFailed { name, .. }
            | Self::Output { name, .. }
            | Self::Exited { name, .. } => name,
        }
    }

    /// Create a current timestamp string in RFC3339 format
    #[must_use]
    pub fn current_timestamp() -> String {
        humantime::format_rfc3339_millis(SystemTime::now()).to_string()
    }

    /// Create a started event
    #[must_use]
    pub fn started(name: String, pid: u32, command: String, args: Vec<String>) -> Self {
        Self::Started {
            name,
            pid,
            command,
            args,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create a spawn failure event
    #[must_use]
    pub fn spawn_failed(name: String, error: String) -> Self {
        Self::SpawnFailed {
            name,
            error,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create an output event
    #[must_use]
    pub fn output(name: String, pid: u32, stream: OutputStream, content: String) -> Self {
        Self::Output {
            name,
            pid,
            stream,
            content,
            timestamp: Self::current_timestamp(),
        }
    }

    /// Create an exit event
    #[must_use]
    pub fn exited(name: String, pid: u32, status: ExitStatus) -> Self {
        Self::Exited {
            name,
            pid,
            status,
            timestamp: Self::current_timestamp(),
        }
    }
}
