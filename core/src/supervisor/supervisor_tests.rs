//! Tests for the polling supervisor
//!
//! These use real child processes (`sh`, `cat`, `sleep`) and record every
//! callback invocation so ordering and exactly-once delivery can be checked.

use super::*;
use schema::ExitStatus;
use std::cell::RefCell;
use std::rc::Rc;

const POLL: Duration = Duration::from_millis(10);
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Started(u32),
    Stdout(String),
    Stderr(String),
    Exit(ExitStatus),
}

type Log = Rc<RefCell<Vec<Event>>>;

fn recording_callbacks(log: &Log) -> ProcessCallbacks {
    let started = Rc::clone(log);
    let stdout = Rc::clone(log);
    let stderr = Rc::clone(log);
    let exit = Rc::clone(log);
    ProcessCallbacks::new()
        .on_started(move |ops| started.borrow_mut().push(Event::Started(ops.pid())))
        .on_stdout(move |_, text| stdout.borrow_mut().push(Event::Stdout(text.to_string())))
        .on_stderr(move |_, text| stderr.borrow_mut().push(Event::Stderr(text.to_string())))
        .on_exit(move |status| exit.borrow_mut().push(Event::Exit(status)))
}

fn joined_stdout(log: &Log) -> String {
    log.borrow()
        .iter()
        .filter_map(|event| match event {
            Event::Stdout(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

fn exits(log: &Log) -> Vec<ExitStatus> {
    log.borrow()
        .iter()
        .filter_map(|event| match event {
            Event::Exit(status) => Some(*status),
            _ => None,
        })
        .collect()
}

#[test]
fn test_callbacks_fire_in_order_exactly_once() {
    let log: Log = Rc::default();
    let mut supervisor = ProcessSupervisor::new();
    let pid = supervisor
        .run_command(
            "echo out; echo err 1>&2; exit 4",
            &ProcessOptions::default(),
            recording_callbacks(&log),
        )
        .unwrap();

    // on_started has already run
    assert_eq!(log.borrow().first(), Some(&Event::Started(pid)));
    assert!(supervisor.has_running_children());

    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));
    assert!(!supervisor.has_running_children());

    let events = log.borrow().clone();
    assert_eq!(events.last(), Some(&Event::Exit(ExitStatus::Exited { code: 4 })));
    assert_eq!(exits(&log).len(), 1);
    assert_eq!(joined_stdout(&log), "out\n");
    assert!(events.contains(&Event::Stderr("err\n".to_string())));

    // nothing more arrives for the removed child
    assert!(!supervisor.poll());
    assert_eq!(log.borrow().len(), events.len());
}

#[test]
fn test_spawn_failure_registers_nothing() {
    let log: Log = Rc::default();
    let mut supervisor = ProcessSupervisor::new();
    let err = supervisor
        .run_program(
            "no_such_program_for_chaperone",
            &[] as &[&str],
            &ProcessOptions::default(),
            recording_callbacks(&log),
        )
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(supervisor.is_empty());
    assert!(log.borrow().is_empty());
    assert!(!supervisor.poll());
}

#[test]
fn test_poll_with_nothing_to_report_is_idempotent() {
    let log: Log = Rc::default();
    let mut supervisor = ProcessSupervisor::new();
    supervisor
        .run_program("sleep", &["5"], &ProcessOptions::default(), recording_callbacks(&log))
        .unwrap();

    for _ in 0..5 {
        assert!(supervisor.poll());
    }
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(supervisor.len(), 1);

    supervisor.terminate_all();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));
}

#[test]
fn test_wait_times_out_and_leaves_children_running() {
    let log: Log = Rc::default();
    let mut supervisor = ProcessSupervisor::new();
    let pid = supervisor
        .run_program("sleep", &["5"], &ProcessOptions::default(), recording_callbacks(&log))
        .unwrap();

    let started = Instant::now();
    assert!(!supervisor.wait(Duration::from_millis(10), Some(Duration::from_millis(50))));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(supervisor.has_running_children());
    assert_eq!(supervisor.pids(), vec![pid]);
    assert!(exits(&log).is_empty());

    supervisor.terminate_all();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));
    assert_eq!(exits(&log), vec![ExitStatus::Signaled { signal: libc::SIGKILL }]);
}

#[test]
fn test_terminate_all_drains_registry() {
    let log: Log = Rc::default();
    let mut supervisor = ProcessSupervisor::named("bulk");
    for _ in 0..3 {
        supervisor
            .run_program("sleep", &["30"], &ProcessOptions::default(), recording_callbacks(&log))
            .unwrap();
    }
    assert_eq!(supervisor.len(), 3);

    supervisor.terminate_all();
    // terminate does not remove entries by itself
    assert_eq!(supervisor.len(), 3);

    let deadline = Instant::now() + TEST_TIMEOUT;
    while supervisor.poll() {
        assert!(Instant::now() < deadline, "children did not exit");
        std::thread::sleep(POLL);
    }
    assert!(!supervisor.has_running_children());
    assert_eq!(exits(&log).len(), 3);
}

#[test]
fn test_terminate_all_gracefully_sends_sigterm() {
    let log: Log = Rc::default();
    let mut supervisor = ProcessSupervisor::new();
    supervisor
        .run_program("sleep", &["30"], &ProcessOptions::default(), recording_callbacks(&log))
        .unwrap();
    supervisor.terminate_all_gracefully();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));
    assert_eq!(exits(&log), vec![ExitStatus::Signaled { signal: libc::SIGTERM }]);
}

#[test]
fn test_on_started_can_write_stdin() {
    let output = Rc::new(RefCell::new(String::new()));
    let sink = Rc::clone(&output);
    let mut supervisor = ProcessSupervisor::new();
    supervisor
        .run_program(
            "cat",
            &[] as &[&str],
            &ProcessOptions::default(),
            ProcessCallbacks::new()
                .on_started(|ops| ops.write_to_stdin("from callback", true).unwrap())
                .on_stdout(move |_, text| sink.borrow_mut().push_str(text)),
        )
        .unwrap();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));
    assert_eq!(output.borrow().as_str(), "from callback");
}

#[test]
fn test_output_callback_can_terminate_child() {
    let log: Log = Rc::default();
    let exit_log = Rc::clone(&log);
    let mut supervisor = ProcessSupervisor::new();
    supervisor
        .run_command(
            "echo ready; sleep 30",
            &ProcessOptions::default(),
            ProcessCallbacks::new()
                .on_stdout(|ops, text| {
                    if text.contains("ready") {
                        ops.terminate().unwrap();
                    }
                })
                .on_exit(move |status| exit_log.borrow_mut().push(Event::Exit(status))),
        )
        .unwrap();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));
    assert_eq!(exits(&log), vec![ExitStatus::Signaled { signal: libc::SIGKILL }]);
}

#[test]
fn test_run_program_with_input_collects_result() {
    let result = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&result);
    let mut supervisor = ProcessSupervisor::new();
    supervisor
        .run_program_with_input(
            "cat",
            &[] as &[&str],
            "line one\nline two\n",
            &ProcessOptions::default(),
            move |r| *sink.borrow_mut() = Some(r),
        )
        .unwrap();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));

    let result = result.borrow_mut().take().expect("on_completed fired");
    assert_eq!(
        result,
        ProcessResult {
            exit_status: 0,
            std_out: "line one\nline two\n".to_string(),
            std_err: String::new(),
        }
    );
}

fn numbered_lines(bytes: usize) -> String {
    let mut text = String::with_capacity(bytes + 16);
    let mut n = 0;
    while text.len() < bytes {
        text.push_str(&format!("{:08}\n", n));
        n += 1;
    }
    text
}

#[test]
fn test_large_input_is_queued_and_flushed() {
    // several pipe buffers' worth, so most of it waits in the queue
    let input = numbered_lines(300 * 1024);
    let result = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&result);
    let mut supervisor = ProcessSupervisor::new();
    supervisor
        .run_program_with_input(
            "cat",
            &[] as &[&str],
            &input,
            &ProcessOptions::default(),
            move |r| *sink.borrow_mut() = Some(r),
        )
        .unwrap();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));

    let result = result.borrow_mut().take().expect("on_completed fired");
    assert_eq!(result.exit_status, 0);
    assert!(result.std_out == input, "output differs from input");
}

#[test]
fn test_rejected_input_kills_child() {
    let input = numbered_lines(300 * 1024);
    let result = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&result);
    let mut supervisor = ProcessSupervisor::new();
    supervisor
        .run_command_with_input(
            "exec 0<&-; sleep 30",
            &input,
            &ProcessOptions::default(),
            move |r| *sink.borrow_mut() = Some(r),
        )
        .unwrap();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));

    let result = result.borrow_mut().take().expect("on_completed fired");
    assert_eq!(result.exit_status, -libc::SIGKILL);
}

#[test]
fn test_rejected_queued_input_is_dropped() {
    let input = numbered_lines(300 * 1024);
    let log: Log = Rc::default();
    let mut supervisor = ProcessSupervisor::new();
    let started = Rc::clone(&log);
    let exit = Rc::clone(&log);
    supervisor
        .run_command(
            "exec 0<&-; sleep 0.2; exit 3",
            &ProcessOptions::default(),
            ProcessCallbacks::new()
                .on_started(move |ops| {
                    // the child may already have closed its end
                    let _ = ops.write_to_stdin(&input, true);
                    started.borrow_mut().push(Event::Started(ops.pid()));
                })
                .on_exit(move |status| exit.borrow_mut().push(Event::Exit(status))),
        )
        .unwrap();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));

    // a plain run only logs the failed write; the child finishes on its own
    assert_eq!(exits(&log), vec![ExitStatus::Exited { code: 3 }]);
}

#[test]
fn test_run_command_with_empty_input_closes_stdin() {
    let result = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&result);
    let mut supervisor = ProcessSupervisor::new();
    // `cat` would block forever if stdin stayed open
    supervisor
        .run_command_with_input("cat; echo done >&2", "", &ProcessOptions::default(), move |r| {
            *sink.borrow_mut() = Some(r)
        })
        .unwrap();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));

    let result = result.borrow_mut().take().expect("on_completed fired");
    assert!(result.success());
    assert_eq!(result.std_out, "");
    assert_eq!(result.std_err, "done\n");
}

#[test]
fn test_large_output_is_delivered_in_order() {
    let output = Rc::new(RefCell::new(String::new()));
    let sink = Rc::clone(&output);
    let mut supervisor = ProcessSupervisor::new();
    supervisor
        .run_command(
            "i=0; while [ $i -lt 20000 ]; do echo $i; i=$((i+1)); done",
            &ProcessOptions::default(),
            ProcessCallbacks::new().on_stdout(move |_, text| sink.borrow_mut().push_str(text)),
        )
        .unwrap();
    assert!(supervisor.wait(Duration::from_millis(1), Some(Duration::from_secs(30))));

    let output = output.borrow();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 20000);
    assert_eq!(lines[0], "0");
    assert_eq!(lines[19999], "19999");
    assert!(lines.windows(2).all(|w| w[0].parse::<u32>().unwrap() + 1 == w[1].parse::<u32>().unwrap()));
}

#[test]
fn test_children_are_independent() {
    let fast: Log = Rc::default();
    let slow: Log = Rc::default();
    let mut supervisor = ProcessSupervisor::new();
    supervisor
        .run_command("exit 0", &ProcessOptions::default(), recording_callbacks(&fast))
        .unwrap();
    supervisor
        .run_program("sleep", &["30"], &ProcessOptions::default(), recording_callbacks(&slow))
        .unwrap();

    let deadline = Instant::now() + TEST_TIMEOUT;
    while exits(&fast).is_empty() {
        assert!(Instant::now() < deadline);
        assert!(supervisor.poll());
        std::thread::sleep(POLL);
    }
    assert_eq!(supervisor.len(), 1);
    assert!(exits(&slow).is_empty());

    supervisor.terminate_all();
    assert!(supervisor.wait(POLL, Some(TEST_TIMEOUT)));
    assert_eq!(exits(&slow).len(), 1);
}
