//! Callback sets attached to supervised children
//!
//! A [`ProcessCallbacks`] value is a plain bundle of independent closures, one
//! per event. Any of them may be left unset. State shared between the
//! closures of one child is held in an `Rc` captured by each of them, so it
//! lives exactly as long as the child's registry entry.

use crate::process::ProcessOperations;
use schema::{ExitStatus, ProcessResult};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::error;

/// Called once, right after the child is registered
pub type StartedFn = Box<dyn FnOnce(&mut ProcessOperations<'_>)>;

/// Called with each newly available chunk of output
pub type OutputFn = Box<dyn FnMut(&mut ProcessOperations<'_>, &str)>;

/// Called once with the exit status; nothing fires for the child afterwards
pub type ExitFn = Box<dyn FnOnce(ExitStatus)>;

/// Event handlers for one supervised child
#[derive(Default)]
pub struct ProcessCallbacks {
    /// Fired synchronously after the child is registered
    pub on_started: Option<StartedFn>,
    /// Fired with standard output, in the order it was read
    pub on_stdout: Option<OutputFn>,
    /// Fired with standard error, in the order it was read
    pub on_stderr: Option<OutputFn>,
    /// Fired exactly once when the exit is observed
    pub on_exit: Option<ExitFn>,
}

impl ProcessCallbacks {
    /// An empty callback set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the start handler
    #[must_use]
    pub fn on_started<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut ProcessOperations<'_>) + 'static,
    {
        self.on_started = Some(Box::new(f));
        self
    }

    /// Set the stdout handler
    #[must_use]
    pub fn on_stdout<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut ProcessOperations<'_>, &str) + 'static,
    {
        self.on_stdout = Some(Box::new(f));
        self
    }

    /// Set the stderr handler
    #[must_use]
    pub fn on_stderr<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut ProcessOperations<'_>, &str) + 'static,
    {
        self.on_stderr = Some(Box::new(f));
        self
    }

    /// Set the exit handler
    #[must_use]
    pub fn on_exit<F>(mut self, f: F) -> Self
    where
        F: FnOnce(ExitStatus) + 'static,
    {
        self.on_exit = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for ProcessCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessCallbacks")
            .field("on_started", &self.on_started.is_some())
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .field("on_exit", &self.on_exit.is_some())
            .finish()
    }
}

/// Write `input` to the child and close its stdin
///
/// A failed write usually means the child exited early; it is logged and the
/// child is killed rather than reported to the caller.
pub fn feed_input(ops: &mut ProcessOperations<'_>, input: &str) {
    if input.is_empty() {
        ops.close_stdin();
        return;
    }
    if let Err(e) = ops.write_to_stdin(input, true) {
        error!("Failed to write input to process {}: {}", ops.pid(), e);
        if let Err(e) = ops.terminate() {
            error!("Failed to terminate process {}: {}", ops.pid(), e);
        }
    }
}

#[derive(Default)]
struct Collected {
    std_out: String,
    std_err: String,
}

/// Callbacks that feed `input`, accumulate all output and hand the finished
/// [`ProcessResult`] to `on_completed`
pub fn completion_callbacks<F>(input: impl Into<String>, on_completed: F) -> ProcessCallbacks
where
    F: FnOnce(ProcessResult) + 'static,
{
    let input = input.into();
    let collected = Rc::new(RefCell::new(Collected::default()));
    let stdout_sink = Rc::clone(&collected);
    let stderr_sink = Rc::clone(&collected);

    ProcessCallbacks::new()
        .on_started(move |ops| feed_input(ops, &input))
        .on_stdout(move |_, chunk| stdout_sink.borrow_mut().std_out.push_str(chunk))
        .on_stderr(move |_, chunk| stderr_sink.borrow_mut().std_err.push_str(chunk))
        .on_exit(move |status| {
            let Collected { std_out, std_err } = collected.take();
            on_completed(ProcessResult {
                exit_status: status.code(),
                std_out,
                std_err,
            });
        })
}
