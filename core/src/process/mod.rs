//! Process management utilities for the Chaperone core library
//!
//! This module provides the launcher and child handle the rest of the crate
//! is built on, with platform-specific implementations for spawning,
//! non-blocking stdio and termination.
//!
//! ## Platform Support
//!
//! - **Unix**: Full support, with optional process groups for tree-wide signals
//! - **Windows**: Not supported yet (Job Object-based lifecycle is the plan)

pub mod decode;
#[cfg(unix)]
pub mod unix;

pub use decode::Utf8Decoder;
#[cfg(unix)]
pub use unix::*;

#[cfg(unix)]
use crate::error::{TerminateError, WriteError};

/// Operations available to callbacks on the child they are attached to
///
/// Handed to `on_started`, `on_stdout` and `on_stderr`. It borrows the child
/// for the duration of a single callback invocation.
#[cfg(unix)]
pub struct ProcessOperations<'a> {
    child: &'a mut ChildHandle,
}

#[cfg(unix)]
impl<'a> ProcessOperations<'a> {
    /// Wrap a child handle
    pub fn new(child: &'a mut ChildHandle) -> Self {
        Self { child }
    }

    /// Process ID of the child
    pub fn pid(&self) -> u32 {
        self.child.pid()
    }

    /// Queue text for the child's stdin, closing stdin afterwards if `auto_close`
    pub fn write_to_stdin(&mut self, data: &str, auto_close: bool) -> Result<(), WriteError> {
        self.child.write_to_stdin(data.as_bytes(), auto_close)
    }

    /// Close the child's stdin, signalling EOF
    pub fn close_stdin(&mut self) {
        self.child.close_stdin();
    }

    /// Forcefully terminate the child
    pub fn terminate(&mut self) -> Result<(), TerminateError> {
        self.child.terminate(true)
    }

    /// Ask the child to stop (SIGTERM)
    pub fn terminate_gracefully(&mut self) -> Result<(), TerminateError> {
        self.child.terminate(false)
    }
}
