//! Integration tests for the backup executor.
//!
//! Most tests drive the executor with small `sh -c` scripts standing in for
//! the sync tool: the script receives `<source>/` as `$1` and the target as
//! `$2`. The end-to-end copy test uses real rsync and skips itself when
//! rsync is not installed.

use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use sdbackup::core::executor::CANCEL_GRACE;
use sdbackup::core::{BackupError, BackupExecutor, JobOutcome, LogSink, SyncCommand};
use tempfile::tempdir;

fn sh(script: &str) -> SyncCommand {
    SyncCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string(), "sync".to_string()],
    }
}

fn has_rsync() -> bool {
    Command::new("rsync").arg("--version").output().is_ok()
}

fn create_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// Wait until the sync process has been spawned and return its pid.
async fn wait_for_pid(executor: &BackupExecutor) -> u32 {
    for _ in 0..500 {
        if let Some(pid) = executor.current_job().and_then(|job| job.pid) {
            return pid;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("backup process never started");
}

fn process_alive(pid: u32) -> bool {
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

#[tokio::test]
async fn rsync_copies_card_contents() {
    if !has_rsync() {
        eprintln!("Skipping: rsync not available");
        return;
    }

    let temp = tempdir().unwrap();
    let source = temp.path().join("card");
    let target = temp.path().join("backup");
    create_file(&source.join("file1.txt"), b"content1");
    create_file(&source.join("file2.txt"), b"content2");
    create_file(&source.join("DCIM/100/img.jpg"), &[0xAB; 4096]);

    let log = LogSink::new();
    let executor = BackupExecutor::new(SyncCommand::default(), log.clone());

    let outcome = executor.start(&source, &target).await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed);
    assert_eq!(std::fs::read(target.join("file1.txt")).unwrap(), b"content1");
    assert_eq!(std::fs::read(target.join("file2.txt")).unwrap(), b"content2");
    assert_eq!(
        std::fs::read(target.join("DCIM/100/img.jpg")).unwrap(),
        vec![0xAB; 4096]
    );
    // Contents are copied, not the directory itself.
    assert!(!target.join("card").exists());

    let messages = log.messages();
    assert!(messages.iter().any(|m| m.starts_with("Starting backup: rsync")));
    assert!(messages.iter().any(|m| m == "Backup completed successfully."));
    assert!(!executor.is_busy());
}

#[tokio::test]
async fn stdout_and_stderr_are_logged_in_order() {
    let temp = tempdir().unwrap();
    let log = LogSink::new();
    let executor = BackupExecutor::new(
        sh("echo to-stdout; echo to-stderr >&2; echo last-line"),
        log.clone(),
    );

    let outcome = executor
        .start(temp.path(), temp.path().join("out"))
        .await
        .unwrap();
    assert_eq!(outcome, JobOutcome::Completed);

    let messages = log.messages();
    let pos = |needle: &str| messages.iter().position(|m| m == needle);
    let stdout = pos("to-stdout").expect("stdout line logged");
    let stderr = pos("to-stderr").expect("stderr line logged");
    let last = pos("last-line").expect("last line logged");
    assert!(stdout < stderr && stderr < last);
}

#[tokio::test]
async fn creates_missing_target_directory() {
    let temp = tempdir().unwrap();
    let target = temp.path().join("a/b/c");
    let executor = BackupExecutor::new(sh("test -d \"$2\""), LogSink::new());

    let outcome = executor.start(temp.path(), &target).await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed);
    assert!(target.is_dir());
}

#[tokio::test]
async fn nonzero_exit_is_reported_with_code_and_command() {
    let temp = tempdir().unwrap();
    let log = LogSink::new();
    let executor = BackupExecutor::new(sh("echo boom >&2; exit 3"), log.clone());

    let err = executor
        .start(temp.path(), temp.path().join("out"))
        .await
        .unwrap_err();

    match err {
        BackupError::Failed { code, command, .. } => {
            assert_eq!(code, Some(3));
            assert!(command.starts_with("sh -c"), "command was {command}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert!(log.messages().iter().any(|m| m == "boom"));
    assert!(!executor.is_busy());
    assert_eq!(executor.status().message, "Idle");
}

#[tokio::test]
async fn missing_tool_is_a_launch_failure() {
    let temp = tempdir().unwrap();
    let executor = BackupExecutor::new(
        SyncCommand {
            program: "/nonexistent/sdbackup-sync-tool".to_string(),
            args: vec![],
        },
        LogSink::new(),
    );

    let err = executor
        .start(temp.path(), temp.path().join("out"))
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::Launch { .. }), "got {err:?}");
    assert!(err.to_string().contains("Could not start"));
    assert!(!executor.is_busy());
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let temp = tempdir().unwrap();
    let executor = BackupExecutor::new(sh("exec sleep 30"), LogSink::new());

    let running = {
        let executor = executor.clone();
        let source = temp.path().join("first");
        let target = temp.path().join("first-out");
        tokio::spawn(async move { executor.start(source, target).await })
    };
    wait_for_pid(&executor).await;
    let before = executor.current_job().unwrap();

    let err = executor
        .start(temp.path().join("second"), temp.path().join("second-out"))
        .await
        .unwrap_err();

    assert!(err.is_already_running());
    let after = executor.current_job().unwrap();
    assert_eq!(after.job_id, before.job_id);
    assert_eq!(after.pid, before.pid);
    assert!(executor.status().active);
    assert_eq!(executor.status().message, "Backup in progress");

    assert!(executor.cancel().await);
    assert_eq!(running.await.unwrap().unwrap(), JobOutcome::Cancelled);
}

#[tokio::test]
async fn cancel_stops_job_within_grace_period() {
    let temp = tempdir().unwrap();
    let log = LogSink::new();
    let executor = BackupExecutor::new(sh("exec sleep 30"), log.clone());

    let running = {
        let executor = executor.clone();
        let source = temp.path().to_path_buf();
        let target = temp.path().join("out");
        tokio::spawn(async move { executor.start(source, target).await })
    };
    let pid = wait_for_pid(&executor).await;

    let started = Instant::now();
    assert!(executor.cancel().await);
    assert!(started.elapsed() < CANCEL_GRACE + Duration::from_secs(1));

    assert_eq!(running.await.unwrap().unwrap(), JobOutcome::Cancelled);
    assert!(!process_alive(pid));
    assert!(!executor.is_busy());
    assert!(!executor.status().active);
    assert!(log.messages().iter().any(|m| m == "Backup cancelled."));
}

#[tokio::test]
async fn cancel_kills_process_that_ignores_sigterm() {
    let temp = tempdir().unwrap();
    let executor = BackupExecutor::new(sh("trap '' TERM; exec sleep 30"), LogSink::new());

    let running = {
        let executor = executor.clone();
        let source = temp.path().to_path_buf();
        let target = temp.path().join("out");
        tokio::spawn(async move { executor.start(source, target).await })
    };
    let pid = wait_for_pid(&executor).await;

    let started = Instant::now();
    assert!(executor.cancel().await);
    let elapsed = started.elapsed();

    assert!(elapsed >= CANCEL_GRACE, "killed too early: {elapsed:?}");
    assert!(elapsed < CANCEL_GRACE + Duration::from_secs(2), "took {elapsed:?}");
    assert_eq!(running.await.unwrap().unwrap(), JobOutcome::Cancelled);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn executor_is_reusable_after_each_outcome() {
    let temp = tempdir().unwrap();
    let ok = BackupExecutor::new(sh("exit 0"), LogSink::new());
    let failing = BackupExecutor::new(sh("exit 1"), LogSink::new());

    for _ in 0..3 {
        assert_eq!(
            ok.start(temp.path(), temp.path().join("out")).await.unwrap(),
            JobOutcome::Completed
        );
        assert!(failing.start(temp.path(), temp.path().join("out")).await.is_err());
    }

    assert!(!ok.is_busy());
    assert!(!failing.is_busy());
}
