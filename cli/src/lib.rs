//! Chaperone command-line front end
//!
//! The binary has two modes:
//!
//! - `run` executes one program (or shell command) to completion and mirrors
//!   its output and exit code
//! - `supervise` launches every program from a supervision file under one
//!   [`ProcessSupervisor`] and streams their output as prefixed lines or as
//!   JSON [`ProcessEvent`] lines

pub mod error;

pub use error::{CliError, Result};

use chaperone_core::config::SupervisionFile;
use chaperone_core::process::ProcessOperations;
use chaperone_core::supervisor::{feed_input, ProcessCallbacks, ProcessSupervisor};
use chaperone_core::sync_runner;
use schema::{ExitStatus, OutputStream, ProcessEvent, ProcessOptions, ProcessResult, ProgramSpec};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use tracing::{info, warn};

/// How `supervise` reports what the programs do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// `[name] line` for stdout, `[name:err] line` for stderr
    Text,
    /// One serialized [`ProcessEvent`] per line
    Json,
}

/// One program to run to completion
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Executable, or a command line when `shell` is set
    pub command: String,
    /// Arguments passed to the executable
    pub args: Vec<String>,
    /// Run `command` through `/bin/sh -c`
    pub shell: bool,
    /// Text written to stdin before it is closed
    pub input: String,
    /// Launch options
    pub options: ProcessOptions,
}

/// Run one program to completion on a blocking worker
pub async fn run_once(request: RunRequest) -> Result<ProcessResult> {
    let RunRequest {
        command,
        args,
        shell,
        input,
        options,
    } = request;

    if shell && !args.is_empty() {
        return Err(CliError::InvalidArgument(
            "arguments cannot be combined with --shell; put them in the command line".to_string(),
        ));
    }

    let result = if shell {
        sync_runner::run_command_blocking(command, input, options).await?
    } else {
        sync_runner::run_program_blocking(command, args, input, options).await?
    };
    Ok(result)
}

/// Map a child's exit code onto a process exit code the way shells do
pub fn shell_exit_code(exit_status: i32) -> i32 {
    if exit_status < 0 {
        128 - exit_status
    } else {
        exit_status
    }
}

/// Outcome of one program under `supervise`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramOutcome {
    /// The program could not be launched
    FailedToStart(String),
    /// The program exited
    Exited(ExitStatus),
    /// The program was still running when the wait gave up
    Abandoned,
}

/// What happened to every configured program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperviseSummary {
    /// Outcomes in configuration order
    pub outcomes: Vec<(String, ProgramOutcome)>,
    /// Whether the wait ran into `maxWaitMs`
    pub timed_out: bool,
}

impl SuperviseSummary {
    /// Whether every program started and exited successfully
    pub fn success(&self) -> bool {
        !self.timed_out
            && self
                .outcomes
                .iter()
                .all(|(_, outcome)| matches!(outcome, ProgramOutcome::Exited(s) if s.success()))
    }
}

fn slot(stream: OutputStream) -> usize {
    match stream {
        OutputStream::Stdout => 0,
        OutputStream::Stderr => 1,
    }
}

type SharedWriter<W> = Rc<RefCell<Reporter<W>>>;

/// Formats events for one output sink
struct Reporter<W> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> Reporter<W> {
    fn event(&mut self, event: &ProcessEvent) {
        let result = match self.format {
            OutputFormat::Json => serde_json::to_string(event)
                .map_err(std::io::Error::from)
                .and_then(|line| writeln!(self.out, "{}", line)),
            OutputFormat::Text => self.text(event),
        };
        if let Err(e) = result.and_then(|_| self.out.flush()) {
            warn!("Failed to report event for {}: {}", event.name(), e);
        }
    }

    fn text(&mut self, event: &ProcessEvent) -> std::io::Result<()> {
        match event {
            ProcessEvent::Started { name, pid, .. } => {
                writeln!(self.out, "[{}] started (pid {})", name, pid)
            }
            ProcessEvent::SpawnFailed { name, error, .. } => {
                writeln!(self.out, "[{}] failed to start: {}", name, error)
            }
            ProcessEvent::Output {
                name,
                stream,
                content,
                ..
            } => {
                let prefix = match stream {
                    OutputStream::Stdout => format!("[{}]", name),
                    OutputStream::Stderr => format!("[{}:err]", name),
                };
                for line in content.lines() {
                    writeln!(self.out, "{} {}", prefix, line)?;
                }
                Ok(())
            }
            ProcessEvent::Exited { name, status, .. } => {
                writeln!(self.out, "[{}] exited with {}", name, status)
            }
        }
    }
}

/// Splits a chunked stream into whole lines for text output
#[derive(Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Append `chunk` and return the complete lines it finished
    fn push(&mut self, chunk: &str) -> Option<String> {
        self.pending.push_str(chunk);
        let end = self.pending.rfind('\n')? + 1;
        let rest = self.pending.split_off(end);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Whatever is left without a trailing newline
    fn take(&mut self) -> Option<String> {
        (!self.pending.is_empty()).then(|| std::mem::take(&mut self.pending))
    }
}

fn program_callbacks<W: Write + 'static>(
    program: &ProgramSpec,
    reporter: &SharedWriter<W>,
    outcome: Rc<RefCell<Option<ExitStatus>>>,
) -> ProcessCallbacks {
    let name = program.name.clone();
    let input = program.input.clone().unwrap_or_default();
    let started_event = (program.command.clone(), program.args.clone());
    // pid is only known once the program runs
    let pid = Rc::new(RefCell::new(0u32));
    let buffers = Rc::new(RefCell::new([LineBuffer::default(), LineBuffer::default()]));

    let emit_output = {
        let name = name.clone();
        let reporter = Rc::clone(reporter);
        let pid = Rc::clone(&pid);
        let buffers = Rc::clone(&buffers);
        move |stream: OutputStream, chunk: &str| {
            let mut reporter = reporter.borrow_mut();
            let content = match reporter.format {
                OutputFormat::Json => Some(chunk.to_string()),
                OutputFormat::Text => buffers.borrow_mut()[slot(stream)].push(chunk),
            };
            if let Some(content) = content {
                reporter.event(&ProcessEvent::output(name.clone(), *pid.borrow(), stream, content));
            }
        }
    };
    let emit_stderr = emit_output.clone();

    let on_exit = {
        let reporter = Rc::clone(reporter);
        let pid = Rc::clone(&pid);
        move |status: ExitStatus| {
            let pid = *pid.borrow();
            let mut reporter = reporter.borrow_mut();
            for stream in [OutputStream::Stdout, OutputStream::Stderr] {
                if let Some(rest) = buffers.borrow_mut()[slot(stream)].take() {
                    reporter.event(&ProcessEvent::output(name.clone(), pid, stream, rest));
                }
            }
            reporter.event(&ProcessEvent::exited(name.clone(), pid, status));
            *outcome.borrow_mut() = Some(status);
        }
    };

    let on_started = {
        let name = program.name.clone();
        let reporter = Rc::clone(reporter);
        move |ops: &mut ProcessOperations<'_>| {
            *pid.borrow_mut() = ops.pid();
            let (command, args) = started_event;
            reporter
                .borrow_mut()
                .event(&ProcessEvent::started(name, ops.pid(), command, args));
            feed_input(ops, &input);
        }
    };

    ProcessCallbacks::new()
        .on_started(on_started)
        .on_stdout(move |_, chunk| emit_output(OutputStream::Stdout, chunk))
        .on_stderr(move |_, chunk| emit_stderr(OutputStream::Stderr, chunk))
        .on_exit(on_exit)
}

/// Launch every configured program, report their output to `out` and wait
///
/// Programs that fail to start are reported and skipped. When the wait
/// times out and `terminateOnTimeout` is set, the remaining programs are
/// killed and reaped before this returns.
pub fn supervise<W: Write + 'static>(
    config: &SupervisionFile,
    format: OutputFormat,
    out: W,
) -> SuperviseSummary {
    let reporter = Rc::new(RefCell::new(Reporter { out, format }));
    let mut supervisor = ProcessSupervisor::named("chaperone");
    let mut slots = Vec::with_capacity(config.programs.len());

    for program in &config.programs {
        let exit = Rc::new(RefCell::new(None));
        let callbacks = program_callbacks(program, &reporter, Rc::clone(&exit));
        let options = program.options();
        let launched = if program.shell {
            supervisor.run_command(&program.command, &options, callbacks)
        } else {
            supervisor.run_program(&program.command, &program.args, &options, callbacks)
        };
        match launched {
            Ok(pid) => info!("Launched {} as pid {}", program.name, pid),
            Err(e) => {
                reporter
                    .borrow_mut()
                    .event(&ProcessEvent::spawn_failed(program.name.clone(), e.to_string()));
                slots.push((program.name.clone(), Err(e.to_string())));
                continue;
            }
        }
        slots.push((program.name.clone(), Ok(exit)));
    }

    let finished = supervisor.wait(config.polling_interval(), config.max_wait());
    if !finished {
        warn!(
            "Timed out with {} programs still running",
            supervisor.len()
        );
        if config.terminate_on_timeout {
            supervisor.terminate_all();
            // killed children still have to be reaped for their exit to be reported
            supervisor.wait(config.polling_interval(), None);
        }
    }

    let outcomes = slots
        .into_iter()
        .map(|(name, slot)| {
            let outcome = match slot {
                Err(e) => ProgramOutcome::FailedToStart(e),
                Ok(exit) => match *exit.borrow() {
                    Some(status) => ProgramOutcome::Exited(status),
                    None => ProgramOutcome::Abandoned,
                },
            };
            (name, outcome)
        })
        .collect();

    SuperviseSummary {
        outcomes,
        timed_out: !finished,
    }
}
