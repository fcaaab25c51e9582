//! Polling process supervisor
//!
//! This module provides [`ProcessSupervisor`], a registry of concurrently
//! running children driven entirely by the caller. Nothing runs in the
//! background: the embedding event loop calls [`ProcessSupervisor::poll`]
//! at whatever cadence suits it, and each call does a bounded amount of
//! non-blocking work.
//!
//! ## Lifecycle
//!
//! Each child moves through three states:
//!
//! ```text
//! Running → Exited → Removed
//! ```
//!
//! A poll pass reads available output for every child, delivers it through
//! `on_stdout`/`on_stderr`, then checks the child for exit. When the exit is
//! observed, `on_exit` fires and the entry is removed at the end of the pass.
//!
//! ## Example
//!
//! ```rust,no_run
//! use chaperone_core::supervisor::{ProcessCallbacks, ProcessSupervisor};
//! use schema::ProcessOptions;
//! use std::time::Duration;
//!
//! let mut supervisor = ProcessSupervisor::new();
//! let callbacks = ProcessCallbacks::new()
//!     .on_stdout(|_, text| print!("{}", text))
//!     .on_exit(|status| println!("exited with {}", status));
//! supervisor.run_program("ls", &["-l"], &ProcessOptions::default(), callbacks)?;
//!
//! supervisor.wait(Duration::from_millis(50), None);
//! # Ok::<(), chaperone_core::CoreError>(())
//! ```

use crate::process::{self, ChildHandle, ProcessOperations, Utf8Decoder};
use crate::Result;
use schema::{OutputStream, ProcessOptions, ProcessResult};
use std::ffi::OsStr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info_span, warn, Span};

mod callbacks;

#[cfg(test)]
mod supervisor_tests;

pub use callbacks::*;

/// One registry entry
struct SupervisedChild {
    child: ChildHandle,
    callbacks: ProcessCallbacks,
    stdout_decoder: Utf8Decoder,
    stderr_decoder: Utf8Decoder,
    /// Kill the child when queued stdin input cannot be delivered
    kill_on_input_failure: bool,
    finished: bool,
}

impl SupervisedChild {
    /// One step of a poll pass for this child
    fn poll_once(&mut self) {
        let SupervisedChild {
            child,
            callbacks,
            stdout_decoder,
            stderr_decoder,
            kill_on_input_failure,
            finished,
        } = self;

        if child.has_pending_input() {
            if let Err(e) = child.flush_stdin() {
                if *kill_on_input_failure {
                    error!("Failed to write input to process {}: {}", child.pid(), e);
                    if let Err(e) = child.terminate(true) {
                        error!("Failed to terminate process {}: {}", child.pid(), e);
                    }
                } else {
                    warn!("Dropped queued input for process {}: {}", child.pid(), e);
                }
            }
        }

        deliver(child, OutputStream::Stdout, stdout_decoder, &mut callbacks.on_stdout);
        deliver(child, OutputStream::Stderr, stderr_decoder, &mut callbacks.on_stderr);

        let status = match child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to check process {} for exit: {}", child.pid(), e);
                return;
            }
        };

        // output drained while recording the exit, then any held-back bytes
        deliver(child, OutputStream::Stdout, stdout_decoder, &mut callbacks.on_stdout);
        deliver(child, OutputStream::Stderr, stderr_decoder, &mut callbacks.on_stderr);
        let tail = stdout_decoder.finish();
        emit(child, &mut callbacks.on_stdout, &tail);
        let tail = stderr_decoder.finish();
        emit(child, &mut callbacks.on_stderr, &tail);

        debug!("Process {} exited with {}", child.pid(), status);
        if let Some(on_exit) = callbacks.on_exit.take() {
            on_exit(status);
        }
        *finished = true;
    }
}

/// Read what `stream` has available and hand it to `callback`
fn deliver(
    child: &mut ChildHandle,
    stream: OutputStream,
    decoder: &mut Utf8Decoder,
    callback: &mut Option<OutputFn>,
) {
    let mut buf = Vec::new();
    let result = match stream {
        OutputStream::Stdout => child.read_stdout(&mut buf),
        OutputStream::Stderr => child.read_stderr(&mut buf),
    };
    if let Err(e) = result {
        warn!(
            "Reading {} of process {} failed; closing the stream: {}",
            stream.as_str(),
            child.pid(),
            e
        );
    }
    if !buf.is_empty() {
        let text = decoder.decode(&buf);
        emit(child, callback, &text);
    }
}

fn emit(child: &mut ChildHandle, callback: &mut Option<OutputFn>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(callback) = callback.as_mut() {
        callback(&mut ProcessOperations::new(child), text);
    }
}

/// Registry of running children polled by the caller
///
/// The supervisor does no internal locking; callers that share one instance
/// across threads must serialize access themselves. Dropping the supervisor
/// releases the pipes of any remaining children but does not kill them.
pub struct ProcessSupervisor {
    children: Vec<SupervisedChild>,
    span: Span,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    /// Create a supervisor that logs under the name `supervisor`
    pub fn new() -> Self {
        Self::named("supervisor")
    }

    /// Create a supervisor whose log records carry `name`
    pub fn named(name: &str) -> Self {
        Self {
            children: Vec::new(),
            span: info_span!("process_supervisor", name = %name),
        }
    }

    /// Spawn `executable` and register it with `callbacks`
    ///
    /// `on_started` runs before this returns. Output and exit are delivered
    /// by later calls to [`ProcessSupervisor::poll`]. Returns the child's PID.
    ///
    /// ## Errors
    ///
    /// Spawn failures are returned as [`crate::CoreError::Spawn`]; nothing is
    /// registered in that case.
    pub fn run_program<S: AsRef<OsStr>>(
        &mut self,
        executable: &str,
        args: &[S],
        options: &ProcessOptions,
        callbacks: ProcessCallbacks,
    ) -> Result<u32> {
        let span = self.span.clone();
        let _entered = span.enter();
        let child = process::spawn(executable, args, options)?;
        Ok(self.register(child, callbacks, false))
    }

    /// Run a shell command line (`/bin/sh -c`) under supervision
    pub fn run_command(
        &mut self,
        command: &str,
        options: &ProcessOptions,
        callbacks: ProcessCallbacks,
    ) -> Result<u32> {
        let (shell, args) = process::shell_invocation(command);
        self.run_program(&shell, &args, options, callbacks)
    }

    /// Spawn `executable`, feed it `input`, and call `on_completed` with the
    /// collected output once it exits
    ///
    /// Stdin is closed after the input is written (immediately when `input`
    /// is empty). If the input cannot be delivered the child is killed and
    /// the failure logged; `on_completed` still fires with whatever was
    /// collected.
    pub fn run_program_with_input<S, F>(
        &mut self,
        executable: &str,
        args: &[S],
        input: &str,
        options: &ProcessOptions,
        on_completed: F,
    ) -> Result<u32>
    where
        S: AsRef<OsStr>,
        F: FnOnce(ProcessResult) + 'static,
    {
        let span = self.span.clone();
        let _entered = span.enter();
        let child = process::spawn(executable, args, options)?;
        let callbacks = completion_callbacks(input, on_completed);
        Ok(self.register(child, callbacks, true))
    }

    /// Shell-command form of [`ProcessSupervisor::run_program_with_input`]
    pub fn run_command_with_input<F>(
        &mut self,
        command: &str,
        input: &str,
        options: &ProcessOptions,
        on_completed: F,
    ) -> Result<u32>
    where
        F: FnOnce(ProcessResult) + 'static,
    {
        let (shell, args) = process::shell_invocation(command);
        self.run_program_with_input(&shell, &args, input, options, on_completed)
    }

    fn register(
        &mut self,
        child: ChildHandle,
        mut callbacks: ProcessCallbacks,
        kill_on_input_failure: bool,
    ) -> u32 {
        let pid = child.pid();
        let on_started = callbacks.on_started.take();
        self.children.push(SupervisedChild {
            child,
            callbacks,
            stdout_decoder: Utf8Decoder::new(),
            stderr_decoder: Utf8Decoder::new(),
            kill_on_input_failure,
            finished: false,
        });
        debug!(
            "Registered process {} ({} children)",
            pid,
            self.children.len()
        );

        if let (Some(on_started), Some(entry)) = (on_started, self.children.last_mut()) {
            on_started(&mut ProcessOperations::new(&mut entry.child));
        }
        pid
    }

    /// Whether any registered child has not yet been observed to exit
    pub fn has_running_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Number of registered children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// PIDs of the registered children
    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().map(|entry| entry.child.pid()).collect()
    }

    /// Run one poll pass over every child
    ///
    /// Returns whether any children remain registered afterwards. Exited
    /// children are removed only after every child has been examined.
    pub fn poll(&mut self) -> bool {
        if self.children.is_empty() {
            return false;
        }
        let _entered = self.span.enter();

        for entry in &mut self.children {
            entry.poll_once();
        }

        let before = self.children.len();
        self.children.retain(|entry| !entry.finished);
        let removed = before - self.children.len();
        if removed > 0 {
            debug!(
                "Removed {} exited children ({} still running)",
                removed,
                self.children.len()
            );
        }

        !self.children.is_empty()
    }

    /// Send SIGKILL to every registered child
    ///
    /// Does not wait; exits are reported by subsequent polls. Failures are
    /// logged.
    pub fn terminate_all(&mut self) {
        self.signal_all(true);
    }

    /// Send SIGTERM to every registered child
    pub fn terminate_all_gracefully(&mut self) {
        self.signal_all(false);
    }

    fn signal_all(&mut self, force: bool) {
        let _entered = self.span.enter();
        for entry in &mut self.children {
            if let Err(e) = entry.child.terminate(force) {
                error!("Failed to terminate process {}: {}", entry.child.pid(), e);
            }
        }
    }

    /// Poll until no children remain or `max_wait` elapses
    ///
    /// Sleeps `polling_interval` between passes. Returns `true` when every
    /// child has exited and `false` on timeout; a `max_wait` of `None` waits
    /// indefinitely. Timing out leaves the remaining children running.
    pub fn wait(&mut self, polling_interval: Duration, max_wait: Option<Duration>) -> bool {
        let deadline = max_wait.and_then(|max| Instant::now().checked_add(max));
        while self.poll() {
            std::thread::sleep(polling_interval);
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    debug!(
                        "Wait timed out with {} children still running",
                        self.children.len()
                    );
                    return false;
                }
            }
        }
        true
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("pids", &self.pids())
            .finish()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if !self.children.is_empty() {
            let _entered = self.span.enter();
            warn!(
                "Supervisor dropped with {} children still running: {:?}",
                self.children.len(),
                self.pids()
            );
        }
    }
}
