//! Integration tests for Unix process management
//!
//! These tests verify that the launcher correctly:
//! - Creates processes in their own process groups (via setsid)
//! - Terminates entire process groups with signals
//! - Handles already-exited children without errors

#![cfg(unix)]
#![allow(unsafe_code)] // Required for libc calls in tests

use chaperone_core::process::{spawn, terminate_with_timeout, ChildHandle};
use chaperone_core::{ExitStatus, ProcessOptions, SpawnError};
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, Instant};

fn wait_for_exit(child: &mut ChildHandle, timeout: Duration) -> ExitStatus {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status,
            Ok(None) => {
                if Instant::now() > deadline {
                    let _ = child.terminate(true);
                    panic!("Process {} did not exit within {:?}", child.pid(), timeout);
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("Error waiting for process {}: {}", child.pid(), e),
        }
    }
}

/// Helper function to verify process group membership
fn get_process_group_id(pid: u32) -> Result<u32, std::io::Error> {
    let pgid = unsafe { libc::getpgid(pid as i32) };
    if pgid == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(pgid as u32)
    }
}

/// Test that spawned processes are in their own process group
#[test]
fn test_process_group_isolation() {
    let mut child = spawn("sleep", &["5"], &ProcessOptions::default()).expect("spawn sleep");

    let parent_pgid = unsafe { libc::getpgrp() };
    let pgid = get_process_group_id(child.pid()).expect("getpgid");

    assert_eq!(pgid, child.pid());
    assert_eq!(child.pgid(), Some(pgid));
    assert_ne!(pgid as i32, parent_pgid);

    child.terminate(true).unwrap();
    wait_for_exit(&mut child, Duration::from_secs(5));
}

/// Without detaching, the child stays in our process group
#[test]
fn test_shared_process_group() {
    let options = ProcessOptions {
        detach_process_group: false,
        ..ProcessOptions::default()
    };
    let mut child = spawn("sleep", &["5"], &options).expect("spawn sleep");

    let parent_pgid = unsafe { libc::getpgrp() };
    assert_eq!(get_process_group_id(child.pid()).unwrap() as i32, parent_pgid);
    assert_eq!(child.pgid(), None);

    child.terminate(true).unwrap();
    let status = wait_for_exit(&mut child, Duration::from_secs(5));
    assert_eq!(status.signal(), Some(libc::SIGKILL));
}

/// Test SIGTERM handling
#[test]
fn test_sigterm_termination() {
    let mut child = spawn("sleep", &["10"], &ProcessOptions::default()).expect("spawn sleep");
    child.terminate(false).expect("Failed to send SIGTERM");

    let status = wait_for_exit(&mut child, Duration::from_secs(5));
    assert_eq!(status, ExitStatus::Signaled { signal: libc::SIGTERM });
    assert!(!status.success());
}

/// Test SIGKILL handling
#[test]
fn test_sigkill_termination() {
    let mut child = spawn("sleep", &["10"], &ProcessOptions::default()).expect("spawn sleep");
    child.terminate(true).expect("Failed to send SIGKILL");

    let status = wait_for_exit(&mut child, Duration::from_secs(5));
    assert_eq!(status.code(), -libc::SIGKILL);
}

/// Test process group termination with child processes
#[test]
fn test_process_group_tree_termination() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("tree.sh");
    std::fs::write(
        &script_path,
        "#!/bin/sh\n# Spawn some background processes\nsleep 30 &\nsleep 30 &\nsleep 30\n",
    )
    .expect("Failed to write test script");
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to set permissions");

    let mut child = spawn(
        script_path.to_str().unwrap(),
        &[] as &[&str],
        &ProcessOptions::default(),
    )
    .expect("Failed to spawn script");
    let pgid = child.pgid().expect("child leads a process group");

    // Give it a moment to spawn child processes
    std::thread::sleep(Duration::from_millis(300));

    child.terminate(true).expect("Failed to kill process group");
    wait_for_exit(&mut child, Duration::from_secs(5));

    // the background sleeps went with it
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let result = unsafe { libc::killpg(pgid as i32, 0) };
        if result == -1 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            assert!(
                errno == libc::ESRCH || errno == libc::EPERM,
                "Unexpected errno: {}",
                errno
            );
            break;
        }
        assert!(
            Instant::now() < deadline,
            "Process group {} survived SIGKILL",
            pgid
        );
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Test graceful termination with timeout
#[test]
fn test_graceful_termination_timeout() {
    let mut child = spawn("sleep", &["5"], &ProcessOptions::default()).expect("spawn sleep");

    let status = terminate_with_timeout(&mut child, Duration::from_millis(500))
        .expect("terminate_with_timeout");
    assert_eq!(status.signal(), Some(libc::SIGTERM));
}

/// Test that signalling an exited child is handled gracefully
#[test]
fn test_signal_exited_process() {
    let mut child = spawn("true", &[] as &[&str], &ProcessOptions::default()).expect("spawn true");
    let status = child.wait().unwrap();
    assert!(status.success());

    assert!(child.terminate(false).is_ok());
    assert!(child.terminate(true).is_ok());
    // the recorded status is frozen
    assert_eq!(child.exit_status(), Some(status));
}

/// Test error handling for invalid commands
#[test]
fn test_spawn_invalid_command() {
    let result = spawn(
        "this_command_definitely_does_not_exist_12345",
        &[] as &[&str],
        &ProcessOptions::default(),
    );
    match result {
        Err(SpawnError::NotFound { .. }) => {}
        Err(e) => panic!("Expected NotFound, got: {:?}", e),
        Ok(child) => panic!("Unexpectedly spawned pid {}", child.pid()),
    }
}

/// Test spawning multiple processes
#[test]
fn test_multiple_processes() {
    let mut child1 = spawn("sleep", &["2"], &ProcessOptions::default()).expect("first sleep");
    let mut child2 = spawn("sleep", &["2"], &ProcessOptions::default()).expect("second sleep");

    assert_ne!(child1.pid(), child2.pid());
    assert_eq!(child1.pgid(), Some(child1.pid()));
    assert_eq!(child2.pgid(), Some(child2.pid()));

    // killing one group leaves the other alone
    child1.terminate(true).unwrap();
    wait_for_exit(&mut child1, Duration::from_secs(5));
    assert!(child2.try_wait().unwrap().is_none());

    child2.terminate(true).unwrap();
    wait_for_exit(&mut child2, Duration::from_secs(5));
}
