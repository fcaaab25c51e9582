//! Unix process launching with non-blocking pipes and process-group signalling
//!
//! This module provides the platform half of the engine: resolving an
//! executable, spawning it with the requested stdio wiring, and wrapping the
//! result in a [`ChildHandle`] whose pipes never block the calling thread.
//!
//! ## Process Groups
//!
//! When [`ProcessOptions::detach_process_group`] is set, the child calls
//! `setsid()` before `exec()`. It then leads its own session and process
//! group, so termination signals are sent to the negative PID and reach every
//! process the child has spawned. Otherwise signals go to the child alone.
//!
//! ## Pipe semantics
//!
//! All captured pipes are switched to `O_NONBLOCK` right after spawning.
//! A read on a pipe has three outcomes:
//!
//! - `EAGAIN`/`EWOULDBLOCK`: no data right now, the stream stays open
//! - a zero-length read: end of stream, the pipe is closed and released
//! - any other error: the pipe is closed; the error is returned to the caller
//!   unless the child has already exited, in which case it is end of stream
//!
//! `EINTR` is always retried.

// Allow unsafe code for this module since process management requires libc calls
#![allow(unsafe_code)]

use crate::error::{SpawnError, TerminateError, WriteError};
use crate::{CoreError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use schema::{EnvironmentMode, ExitStatus, ProcessOptions, StdioMode};
use std::ffi::{OsStr, OsString};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Shell used to run command lines
pub const SHELL: &str = "/bin/sh";

/// Search path used when the child environment provides no `PATH`
const DEFAULT_SEARCH_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Size of a single `read(2)` on a pipe
const READ_CHUNK: usize = 8192;

/// Upper bound on bytes taken from one stream per read call, so a child that
/// writes continuously cannot keep a poll pass busy forever
const MAX_READ_PER_CALL: usize = 256 * 1024;

/// Whether a stream can still produce data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// The pipe is open; more data may arrive later
    Open,
    /// End of stream was reached or the stream was never piped
    Closed,
}

/// Outcome of checking a candidate executable path
enum Candidate {
    Executable,
    NotExecutable,
    Missing,
}

fn check_candidate(path: &Path) -> Candidate {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.permissions().mode() & 0o111 != 0 => {
            Candidate::Executable
        }
        Ok(_) => Candidate::NotExecutable,
        Err(_) => Candidate::Missing,
    }
}

fn search_path(options: &ProcessOptions) -> OsString {
    if let Some(path) = options.environment.get("PATH") {
        return OsString::from(path);
    }
    match options.environment_mode {
        EnvironmentMode::Clear => OsString::from(DEFAULT_SEARCH_PATH),
        EnvironmentMode::Inherit => {
            std::env::var_os("PATH").unwrap_or_else(|| OsString::from(DEFAULT_SEARCH_PATH))
        }
    }
}

/// Locate the executable that `spawn` would run
///
/// Names containing a `/` are taken as paths; relative ones are resolved
/// against the configured working directory, itself taken relative to the
/// parent's current directory. Bare names are looked up in the
/// child's `PATH` (the override if one is given, else the inherited one).
///
/// ## Errors
///
/// - [`SpawnError::NotFound`] when nothing matches
/// - [`SpawnError::PermissionDenied`] when a match exists but is not an
///   executable regular file
pub fn resolve_executable(
    executable: &str,
    options: &ProcessOptions,
) -> std::result::Result<PathBuf, SpawnError> {
    let not_found = || SpawnError::NotFound {
        executable: executable.to_string(),
    };
    if executable.is_empty() {
        return Err(not_found());
    }

    // the child runs from the working directory, so relative results must not
    // depend on it again
    let base = match options.working_directory.as_deref() {
        Some(dir) if dir.is_relative() => {
            let cwd = std::env::current_dir().map_err(|source| SpawnError::OsFailure {
                executable: executable.to_string(),
                source,
            })?;
            Some(cwd.join(dir))
        }
        other => other.map(Path::to_path_buf),
    };
    let base = base.as_deref();

    if executable.contains('/') {
        let path = match base {
            Some(dir) if Path::new(executable).is_relative() => dir.join(executable),
            _ => PathBuf::from(executable),
        };
        return match check_candidate(&path) {
            Candidate::Executable => Ok(path),
            Candidate::NotExecutable => Err(SpawnError::PermissionDenied { path }),
            Candidate::Missing => Err(not_found()),
        };
    }

    let mut denied = None;
    for dir in std::env::split_paths(&search_path(options)) {
        // an empty PATH entry means the current directory
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        };
        let dir = match base {
            Some(b) if dir.is_relative() => b.join(dir),
            _ => dir,
        };
        let candidate = dir.join(executable);
        match check_candidate(&candidate) {
            Candidate::Executable => return Ok(candidate),
            Candidate::NotExecutable => {
                denied.get_or_insert(candidate);
            }
            Candidate::Missing => {}
        }
    }

    match denied {
        Some(path) => Err(SpawnError::PermissionDenied { path }),
        None => Err(not_found()),
    }
}

fn stdio_for(mode: StdioMode) -> Stdio {
    match mode {
        StdioMode::Pipe => Stdio::piped(),
        StdioMode::Inherit => Stdio::inherit(),
        StdioMode::Null => Stdio::null(),
    }
}

fn spawn_error(executable: &str, path: &Path, err: io::Error) -> SpawnError {
    match err.kind() {
        io::ErrorKind::NotFound => SpawnError::NotFound {
            executable: executable.to_string(),
        },
        io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => SpawnError::OsFailure {
            executable: executable.to_string(),
            source: err,
        },
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Convert a platform exit status, keeping signal terminations distinct
pub fn exit_status_from_std(status: std::process::ExitStatus) -> ExitStatus {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitStatus::Exited { code },
        (None, Some(signal)) => ExitStatus::Signaled { signal },
        // waitpid without WUNTRACED never reports stopped children
        (None, None) => ExitStatus::Exited { code: -1 },
    }
}

/// Split a command line into the shell invocation that runs it
pub fn shell_invocation(command: &str) -> (String, Vec<String>) {
    (
        SHELL.to_string(),
        vec!["-c".to_string(), command.to_string()],
    )
}

/// Spawn a child process and return immediately
///
/// The executable is resolved with [`resolve_executable`], the child gets the
/// environment, working directory and stdio wiring described by `options`,
/// and every piped stream is made non-blocking before the handle is returned.
///
/// ## Example
///
/// ```rust,no_run
/// use chaperone_core::process::spawn;
/// use schema::ProcessOptions;
///
/// let mut child = spawn("echo", &["hello", "world"], &ProcessOptions::default())?;
/// println!("Spawned process with PID: {}", child.pid());
/// let status = child.wait()?;
/// assert!(status.success());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn spawn<S: AsRef<OsStr>>(
    executable: &str,
    args: &[S],
    options: &ProcessOptions,
) -> std::result::Result<ChildHandle, SpawnError> {
    if let Some(dir) = &options.working_directory {
        if !dir.is_dir() {
            return Err(SpawnError::OsFailure {
                executable: executable.to_string(),
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("working directory {} does not exist", dir.display()),
                ),
            });
        }
    }

    let path = resolve_executable(executable, options)?;
    debug!(
        "Spawning process: {} {:?}",
        path.display(),
        args.iter().map(|a| a.as_ref()).collect::<Vec<&OsStr>>()
    );

    let mut command = Command::new(&path);
    command.arg0(executable).args(args);
    if let Some(dir) = &options.working_directory {
        command.current_dir(dir);
    }
    if options.environment_mode == EnvironmentMode::Clear {
        command.env_clear();
    }
    command.envs(&options.environment);
    command
        .stdin(stdio_for(options.stdin))
        .stdout(stdio_for(options.stdout))
        .stderr(stdio_for(options.stderr));

    if options.detach_process_group {
        // Safety: setsid() is async-signal-safe and appropriate for use in pre_exec
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = command.spawn().map_err(|e| {
        error!("Failed to spawn process '{}': {}", executable, e);
        spawn_error(executable, &path, e)
    })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let fds = [
        stdin.as_ref().map(AsRawFd::as_raw_fd),
        stdout.as_ref().map(AsRawFd::as_raw_fd),
        stderr.as_ref().map(AsRawFd::as_raw_fd),
    ];
    if let Err(e) = fds.into_iter().flatten().try_for_each(set_nonblocking) {
        error!("Failed to make pipes of '{}' non-blocking: {}", executable, e);
        if let Err(kill_err) = child.kill() {
            warn!("Failed to kill half-initialized child: {}", kill_err);
        }
        if let Err(wait_err) = child.wait() {
            warn!("Failed to reap half-initialized child: {}", wait_err);
        }
        return Err(SpawnError::OsFailure {
            executable: executable.to_string(),
            source: e,
        });
    }

    let pid = Pid::from_raw(child.id() as i32);
    debug!(
        "Successfully spawned process {}{}",
        pid,
        if options.detach_process_group {
            " in new process group"
        } else {
            ""
        }
    );

    Ok(ChildHandle {
        pid,
        child,
        stdin,
        stdout,
        stderr,
        pending_input: Vec::new(),
        close_stdin_when_flushed: false,
        stdout_residual: Vec::new(),
        stderr_residual: Vec::new(),
        process_group: options.detach_process_group,
        status: None,
    })
}

/// A live child process and the supervisor's ends of its pipes
///
/// Once the exit has been observed (through [`ChildHandle::try_wait`] or
/// [`ChildHandle::wait`]) the status is frozen, stdin is closed and the
/// output pipes are released after a final drain; output from that drain is
/// still returned by the next read calls.
#[derive(Debug)]
pub struct ChildHandle {
    pid: Pid,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    pending_input: Vec<u8>,
    close_stdin_when_flushed: bool,
    stdout_residual: Vec<u8>,
    stderr_residual: Vec<u8>,
    process_group: bool,
    status: Option<ExitStatus>,
}

impl ChildHandle {
    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Process group ID, when the child leads its own group
    pub fn pgid(&self) -> Option<u32> {
        self.process_group.then(|| self.pid())
    }

    /// Whether the exit has been observed
    pub fn exited(&self) -> bool {
        self.status.is_some()
    }

    /// Exit status, once the exit has been observed
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Whether stdin can still accept data
    pub fn is_stdin_open(&self) -> bool {
        self.stdin.is_some()
    }

    /// Whether queued stdin data is still waiting to be written
    pub fn has_pending_input(&self) -> bool {
        !self.pending_input.is_empty()
    }

    /// Whether stdout or stderr may still produce data
    pub fn has_open_output(&self) -> bool {
        self.stdout.is_some()
            || self.stderr.is_some()
            || !self.stdout_residual.is_empty()
            || !self.stderr_residual.is_empty()
    }

    /// Queue `data` for the child's stdin and write as much as the pipe accepts
    ///
    /// Whatever does not fit is kept and written by later calls to
    /// [`ChildHandle::flush_stdin`]. With `auto_close`, stdin is closed as soon
    /// as the queue is empty, which signals EOF to the child.
    pub fn write_to_stdin(
        &mut self,
        data: &[u8],
        auto_close: bool,
    ) -> std::result::Result<(), WriteError> {
        if self.exited() || self.stdin.is_none() {
            return Err(WriteError::Closed { pid: self.pid() });
        }
        self.pending_input.extend_from_slice(data);
        if auto_close {
            self.close_stdin_when_flushed = true;
        }
        self.flush_stdin()
    }

    /// Write queued stdin data without blocking
    pub fn flush_stdin(&mut self) -> std::result::Result<(), WriteError> {
        let pid = self.pid();
        while !self.pending_input.is_empty() {
            let Some(stdin) = self.stdin.as_mut() else {
                self.pending_input.clear();
                return Err(WriteError::Closed { pid });
            };
            let result = stdin.write(&self.pending_input);
            match result {
                Ok(0) => {
                    self.close_stdin();
                    return Err(WriteError::Closed { pid });
                }
                Ok(n) => {
                    self.pending_input.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    self.close_stdin();
                    return Err(WriteError::Closed { pid });
                }
                Err(e) => {
                    self.close_stdin();
                    return Err(WriteError::OsFailure { pid, source: e });
                }
            }
        }
        if self.close_stdin_when_flushed {
            self.close_stdin();
        }
        Ok(())
    }

    /// Close stdin immediately, discarding queued data
    pub fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            debug!("Closed stdin of process {}", self.pid);
        }
        self.pending_input.clear();
        self.close_stdin_when_flushed = false;
    }

    /// Read whatever stdout has available into `out`
    pub fn read_stdout(&mut self, out: &mut Vec<u8>) -> io::Result<StreamState> {
        read_stream(&mut self.stdout, &mut self.stdout_residual, out)
    }

    /// Read whatever stderr has available into `out`
    pub fn read_stderr(&mut self, out: &mut Vec<u8>) -> io::Result<StreamState> {
        read_stream(&mut self.stderr, &mut self.stderr_residual, out)
    }

    /// Check for exit without blocking
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match self.child.try_wait() {
            Ok(Some(status)) => Ok(Some(self.record_exit(exit_status_from_std(status)))),
            Ok(None) => Ok(None),
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => Ok(Some(self.reaped_elsewhere())),
            Err(e) => Err(e),
        }
    }

    /// Block until the child exits
    ///
    /// Only call this once the output pipes are closed or drained by someone
    /// else; a child blocked on a full pipe never exits.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        match self.child.wait() {
            Ok(status) => Ok(self.record_exit(exit_status_from_std(status))),
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => Ok(self.reaped_elsewhere()),
            Err(e) => Err(e),
        }
    }

    fn reaped_elsewhere(&mut self) -> ExitStatus {
        warn!(
            "Process {} was reaped elsewhere; reporting exit code -1",
            self.pid
        );
        self.record_exit(ExitStatus::Exited { code: -1 })
    }

    /// Block until a pipe is ready or `timeout` passes
    ///
    /// Watches stdout and stderr for input, and stdin for writability while
    /// queued input remains. Sleeps for `timeout` when no pipe is open.
    pub fn wait_for_io(&self, timeout: Duration) -> io::Result<()> {
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(3);
        let mut watch = |fd: RawFd, events: libc::c_short| {
            fds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        };
        if let Some(stdout) = &self.stdout {
            watch(stdout.as_raw_fd(), libc::POLLIN);
        }
        if let Some(stderr) = &self.stderr {
            watch(stderr.as_raw_fd(), libc::POLLIN);
        }
        if let (Some(stdin), false) = (&self.stdin, self.pending_input.is_empty()) {
            watch(stdin.as_raw_fd(), libc::POLLOUT);
        }

        if fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(());
        }

        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Request termination
    ///
    /// `force` sends SIGKILL, otherwise SIGTERM. Signals go to the whole
    /// process group when the child leads one. Calling this after the exit was
    /// observed, or for a process that is already gone, is a no-op.
    pub fn terminate(&mut self, force: bool) -> std::result::Result<(), TerminateError> {
        if self.exited() {
            debug!("Process {} already exited; not signalling", self.pid);
            return Ok(());
        }
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        self.send_signal(signal)
    }

    fn send_signal(&self, signal: Signal) -> std::result::Result<(), TerminateError> {
        let target = if self.process_group {
            "process group"
        } else {
            "process"
        };
        debug!("Sending {} to {} {}", signal, target, self.pid);

        let result = if self.process_group {
            killpg(self.pid, signal)
        } else {
            kill(self.pid, signal)
        };

        match result {
            Ok(()) => {
                debug!("Successfully sent {} to {} {}", signal, target, self.pid);
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!("{} {} already exited", target, self.pid);
                Ok(())
            }
            Err(Errno::EPERM) => {
                debug!(
                    "Permission denied signaling {} {} (likely already exited)",
                    target, self.pid
                );
                Ok(())
            }
            Err(errno) => {
                error!("Failed to send {} to {} {}: {}", signal, target, self.pid, errno);
                Err(TerminateError::OsFailure {
                    pid: self.pid(),
                    signal: signal.as_str(),
                    errno,
                })
            }
        }
    }

    /// Freeze the exit status, take the output still buffered in the pipes and
    /// release every pipe
    fn record_exit(&mut self, status: ExitStatus) -> ExitStatus {
        if let Some(stdout) = self.stdout.as_mut() {
            if let Err(e) = drain_nonblocking(stdout, &mut self.stdout_residual) {
                debug!("Final stdout drain of process {} failed: {}", self.pid, e);
            }
        }
        if let Some(stderr) = self.stderr.as_mut() {
            if let Err(e) = drain_nonblocking(stderr, &mut self.stderr_residual) {
                debug!("Final stderr drain of process {} failed: {}", self.pid, e);
            }
        }
        self.stdout = None;
        self.stderr = None;
        self.close_stdin();
        self.status = Some(status);
        debug!("Process {} exited with {}", self.pid, status);
        status
    }
}

/// Read until the pipe would block, reaches EOF or the per-call cap
///
/// Returns `true` on end of stream.
fn drain_nonblocking<R: Read>(reader: &mut R, out: &mut Vec<u8>) -> io::Result<bool> {
    let mut buf = [0u8; READ_CHUNK];
    let mut total = 0;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                total += n;
                if total >= MAX_READ_PER_CALL {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

fn read_stream<R: Read>(
    pipe: &mut Option<R>,
    residual: &mut Vec<u8>,
    out: &mut Vec<u8>,
) -> io::Result<StreamState> {
    out.append(residual);
    let Some(reader) = pipe.as_mut() else {
        return Ok(StreamState::Closed);
    };
    match drain_nonblocking(reader, out) {
        Ok(true) => {
            *pipe = None;
            Ok(StreamState::Closed)
        }
        Ok(false) => Ok(StreamState::Open),
        Err(e) => {
            *pipe = None;
            Err(e)
        }
    }
}

/// Perform graceful termination with timeout fallback to forceful termination
///
/// Sends SIGTERM, waits up to `timeout` for the child to exit, then sends
/// SIGKILL and waits up to five more seconds.
///
/// ## Example
///
/// ```rust,no_run
/// use chaperone_core::process::{spawn, terminate_with_timeout};
/// use schema::ProcessOptions;
/// use std::time::Duration;
///
/// let mut child = spawn("sleep", &["30"], &ProcessOptions::default())?;
/// terminate_with_timeout(&mut child, Duration::from_secs(5))?;
/// # Ok::<(), chaperone_core::CoreError>(())
/// ```
pub fn terminate_with_timeout(child: &mut ChildHandle, timeout: Duration) -> Result<ExitStatus> {
    // First try graceful termination
    child.terminate(false)?;

    if let Some(status) = wait_until(child, timeout)? {
        debug!(
            "Process {} exited gracefully with status: {}",
            child.pid, status
        );
        return Ok(status);
    }

    warn!(
        "Process {} did not exit gracefully within {:?}, using SIGKILL",
        child.pid, timeout
    );
    child.terminate(true)?;

    let kill_timeout = Duration::from_secs(5);
    if let Some(status) = wait_until(child, kill_timeout)? {
        debug!("Process {} exited after SIGKILL with status: {}", child.pid, status);
        return Ok(status);
    }

    Err(CoreError::ProcessWait(format!(
        "Process {} did not exit even after SIGKILL within {:?}",
        child.pid, kill_timeout
    )))
}

fn wait_until(child: &mut ChildHandle, timeout: Duration) -> Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
