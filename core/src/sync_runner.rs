//! Run-to-completion execution of a single child
//!
//! [`run_program`] spawns a child, writes its input, collects stdout and
//! stderr into memory and blocks until it exits. Reading and writing are
//! multiplexed on the calling thread with `poll(2)`, so a child that fills one
//! pipe while the runner is busy with another cannot deadlock the call.
//!
//! Async callers use [`run_program_blocking`] / [`run_command_blocking`],
//! which move the same work onto tokio's blocking thread pool.

use crate::process::{self, ChildHandle, StreamState};
use crate::{CoreError, Result};
use schema::{OutputStream, ProcessOptions, ProcessResult};
use std::ffi::OsStr;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Longest single sleep in `poll(2)` while the child runs
const IO_WAIT: Duration = Duration::from_millis(50);

/// Run `executable` to completion
///
/// Non-empty `input` is written to stdin, which is then closed; with empty
/// input stdin is closed right away. A failure to deliver the input is logged
/// and the child is killed; the call still returns the collected result.
///
/// ## Errors
///
/// Spawn failures are returned unchanged as [`CoreError::Spawn`]. Failing to
/// wait for the child is a [`CoreError::IoError`].
///
/// ## Example
///
/// ```rust,no_run
/// use chaperone_core::sync_runner::run_program;
/// use schema::ProcessOptions;
///
/// let result = run_program("echo", &["hello"], "", &ProcessOptions::default())?;
/// assert_eq!(result.std_out, "hello\n");
/// # Ok::<(), chaperone_core::CoreError>(())
/// ```
pub fn run_program<S: AsRef<OsStr>>(
    executable: &str,
    args: &[S],
    input: &str,
    options: &ProcessOptions,
) -> Result<ProcessResult> {
    let mut child = process::spawn(executable, args, options)?;
    let pid = child.pid();

    if input.is_empty() {
        child.close_stdin();
    } else if let Err(e) = child.write_to_stdin(input.as_bytes(), true) {
        abandon_input(&mut child, &e);
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let status = loop {
        if child.has_pending_input() {
            if let Err(e) = child.flush_stdin() {
                abandon_input(&mut child, &e);
            }
        }

        collect(&mut child, OutputStream::Stdout, &mut stdout);
        collect(&mut child, OutputStream::Stderr, &mut stderr);

        // nothing left to multiplex; a blocking wait cannot stall the child
        if !child.has_open_output() && !child.has_pending_input() {
            break child.wait()?;
        }

        if let Some(status) = child.try_wait()? {
            collect(&mut child, OutputStream::Stdout, &mut stdout);
            collect(&mut child, OutputStream::Stderr, &mut stderr);
            break status;
        }

        child.wait_for_io(IO_WAIT)?;
    };

    debug!(
        "Process {} finished with {} ({} bytes stdout, {} bytes stderr)",
        pid,
        status,
        stdout.len(),
        stderr.len()
    );

    Ok(ProcessResult {
        exit_status: status.code(),
        std_out: String::from_utf8_lossy(&stdout).into_owned(),
        std_err: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Run a shell command line (`/bin/sh -c`) to completion
pub fn run_command(command: &str, input: &str, options: &ProcessOptions) -> Result<ProcessResult> {
    let (shell, args) = process::shell_invocation(command);
    run_program(&shell, &args, input, options)
}

/// [`run_program`] on tokio's blocking thread pool
pub async fn run_program_blocking(
    executable: String,
    args: Vec<String>,
    input: String,
    options: ProcessOptions,
) -> Result<ProcessResult> {
    tokio::task::spawn_blocking(move || run_program(&executable, &args, &input, &options))
        .await
        .map_err(|e| CoreError::ProcessWait(format!("Runner thread failed: {}", e)))?
}

/// [`run_command`] on tokio's blocking thread pool
pub async fn run_command_blocking(
    command: String,
    input: String,
    options: ProcessOptions,
) -> Result<ProcessResult> {
    tokio::task::spawn_blocking(move || run_command(&command, &input, &options))
        .await
        .map_err(|e| CoreError::ProcessWait(format!("Runner thread failed: {}", e)))?
}

fn abandon_input(child: &mut ChildHandle, err: &crate::error::WriteError) {
    error!("Failed to write input to process {}: {}", child.pid(), err);
    if let Err(e) = child.terminate(true) {
        error!("Failed to terminate process {}: {}", child.pid(), e);
    }
}

fn collect(child: &mut ChildHandle, stream: OutputStream, out: &mut Vec<u8>) {
    let result = match stream {
        OutputStream::Stdout => child.read_stdout(out),
        OutputStream::Stderr => child.read_stderr(out),
    };
    match result {
        Ok(StreamState::Open) | Ok(StreamState::Closed) => {}
        Err(e) => warn!(
            "Reading {} of process {} failed; closing the stream: {}",
            stream.as_str(),
            child.pid(),
            e
        ),
    }
}
