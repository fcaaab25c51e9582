//! Core error types and utilities

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to launch a child process
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("executable not found: {executable}")]
    NotFound { executable: String },

    #[error("permission denied executing {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("failed to spawn {executable}: {source}")]
    OsFailure {
        executable: String,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    /// Raw OS error code, when the failure came from a system call
    pub fn os_code(&self) -> Option<i32> {
        match self {
            SpawnError::OsFailure { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Failure to deliver data to a child's standard input
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("stdin of process {pid} is closed")]
    Closed { pid: u32 },

    #[error("failed to write to stdin of process {pid}: {source}")]
    OsFailure {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Failure to signal a child process
#[derive(Error, Debug)]
pub enum TerminateError {
    #[error("failed to send {signal} to process {pid}: {errno}")]
    OsFailure {
        pid: u32,
        signal: &'static str,
        errno: nix::errno::Errno,
    },
}

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Terminate error: {0}")]
    Terminate(#[from] TerminateError),

    #[error("Process wait error: {0}")]
    ProcessWait(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigurationError(_) => "CORE001",
            CoreError::ValidationError(_) => "CORE002",
            CoreError::InitializationError(_) => "CORE003",
            CoreError::IoError(_) => "CORE005",
            CoreError::Spawn(_) => "CORE010",
            CoreError::Write(_) => "CORE011",
            CoreError::Terminate(_) => "CORE012",
            CoreError::ProcessWait(_) => "CORE013",
        }
    }

    /// Whether this is a spawn failure because the executable could not be found
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::Spawn(SpawnError::NotFound { .. }))
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;
