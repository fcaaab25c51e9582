//! Supervision file loading and validation
//!
//! This module parses a TOML supervision file into a list of
//! `schema::ProgramSpec` values plus the polling settings used to drive a
//! [`crate::supervisor::ProcessSupervisor`], applies defaults (via serde
//! defaults), and performs strict validation with field-path error messages.

use crate::{CoreError, Result};
use schema::ProgramSpec;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

fn default_polling_interval_ms() -> u64 {
    50
}

fn default_terminate_on_timeout() -> bool {
    true
}

/// Top-level TOML structure for a supervision run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisionFile {
    /// Sleep between poll passes, in milliseconds
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Give up waiting after this many milliseconds; absent waits forever
    #[serde(default)]
    pub max_wait_ms: Option<u64>,

    /// Kill the remaining programs when the wait times out
    #[serde(default = "default_terminate_on_timeout")]
    pub terminate_on_timeout: bool,

    /// Programs to launch
    pub programs: Vec<ProgramSpec>,
}

impl SupervisionFile {
    /// Interval between poll passes
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Upper bound on the wait, if any
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }

    /// Validate the configuration and return `Result<()>` with field-path errors
    pub fn validate(&self) -> Result<()> {
        if self.polling_interval_ms == 0 {
            return Err(CoreError::ValidationError(
                "pollingIntervalMs: must be > 0".to_string(),
            ));
        }
        if self.programs.is_empty() {
            return Err(CoreError::ValidationError(
                "programs: must contain at least one program".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (i, program) in self.programs.iter().enumerate() {
            if program.name.trim().is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "programs[{}].name: cannot be empty",
                    i
                )));
            }
            if !seen.insert(program.name.as_str()) {
                return Err(CoreError::ValidationError(format!(
                    "programs[{}].name: duplicate name '{}'",
                    i, program.name
                )));
            }
            if program.command.trim().is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "programs[{}].command: cannot be empty",
                    i
                )));
            }
            if program.shell && !program.args.is_empty() {
                return Err(CoreError::ValidationError(format!(
                    "programs[{}].args: not allowed when shell = true",
                    i
                )));
            }
            if program.environment.keys().any(|k| k.trim().is_empty()) {
                return Err(CoreError::ValidationError(format!(
                    "programs[{}].environment: keys cannot be empty",
                    i
                )));
            }
            if let Some(dir) = &program.working_directory {
                if dir.as_os_str().is_empty() {
                    return Err(CoreError::ValidationError(format!(
                        "programs[{}].workingDirectory: cannot be empty",
                        i
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Load a supervision file from a TOML file path
pub fn load_from_toml_path(path: impl AsRef<Path>) -> Result<SupervisionFile> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_from_toml_str(&data)
}

/// Load a supervision file from a TOML string
pub fn load_from_toml_str(input: &str) -> Result<SupervisionFile> {
    let cfg: SupervisionFile = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}
