//! Core functionality for Chaperone
//!
//! This crate contains the child-process supervision engine: launching
//! programs with non-blocking pipes, running a single program to completion,
//! and polling a registry of concurrently running programs through caller
//! supplied callbacks.

pub mod config;
pub mod error;
#[cfg(unix)]
pub mod process;
#[cfg(unix)]
pub mod supervisor;
#[cfg(unix)]
pub mod sync_runner;


// Re-export schema types for convenience
pub use schema::*;

pub use error::{CoreError, Result, SpawnError, TerminateError, WriteError};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    ///
    /// `RUST_LOG` takes precedence over `level` when it is set.
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
