//! Backup subprocess lifecycle.
//!
//! At most one job runs at a time. A job is reserved atomically by
//! [`BackupExecutor::begin`], which hands out a [`JobTicket`]; running the
//! ticket launches the sync tool, drains its merged output into the log sink
//! and returns the executor to idle once the process is gone.

use std::ffi::OsString;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::log_sink::LogSink;

/// How long a cancelled job gets to exit after SIGTERM before SIGKILL.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);
/// Extra time `cancel` waits for the job to report back after the grace period.
const CANCEL_MARGIN: Duration = Duration::from_secs(2);
/// How long to keep reading output after the process has exited.
const DRAIN_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("A backup is already in progress (job {job_id})")]
    AlreadyRunning { job_id: Uuid },

    #[error("Failed to create target directory {path}: {source}")]
    TargetDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not start backup command `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Backup command `{command}` failed ({status})")]
    Failed {
        code: Option<i32>,
        status: String,
        command: String,
    },

    #[error("Lost track of backup command `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl BackupError {
    pub fn is_already_running(&self) -> bool {
        matches!(self, BackupError::AlreadyRunning { .. })
    }
}

/// Terminal state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStatus {
    pub active: bool,
    pub message: String,
}

/// Read-only view of the running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: Uuid,
    pub source: PathBuf,
    pub target: PathBuf,
    pub pid: Option<u32>,
}

/// External sync tool invocation: `<program> <args..> <source>/ <target>`.
#[derive(Debug, Clone)]
pub struct SyncCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for SyncCommand {
    fn default() -> Self {
        Self {
            program: "rsync".to_string(),
            args: vec!["-av".to_string(), "--info=progress2".to_string()],
        }
    }
}

impl SyncCommand {
    /// Source with a trailing slash so the tool copies its contents rather
    /// than the directory itself.
    fn source_arg(source: &Path) -> OsString {
        let mut arg = source.as_os_str().to_os_string();
        if !arg.to_string_lossy().ends_with('/') {
            arg.push("/");
        }
        arg
    }

    fn describe(&self, source: &Path, target: &Path) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.push(Self::source_arg(source).to_string_lossy().into_owned());
        parts.push(target.display().to_string());
        parts.join(" ")
    }
}

enum JobState {
    Idle,
    Running(ActiveJob),
}

struct ActiveJob {
    job_id: Uuid,
    source: PathBuf,
    target: PathBuf,
    /// Set while the process is alive.
    pid: Option<u32>,
    cancel: CancellationToken,
    finished: watch::Receiver<Option<JobOutcome>>,
}

#[derive(Clone)]
pub struct BackupExecutor {
    state: Arc<Mutex<JobState>>,
    log: LogSink,
    command: Arc<SyncCommand>,
}

impl BackupExecutor {
    pub fn new(command: SyncCommand, log: LogSink) -> Self {
        Self {
            state: Arc::new(Mutex::new(JobState::Idle)),
            log,
            command: Arc::new(command),
        }
    }

    /// Atomically reserve the executor for a new job.
    ///
    /// Fails with [`BackupError::AlreadyRunning`] if a job holds the
    /// reservation; the running job is not touched.
    pub fn begin(
        &self,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Result<JobTicket, BackupError> {
        let source = source.into();
        let target = target.into();

        let mut state = lock(&self.state);
        if let JobState::Running(job) = &*state {
            return Err(BackupError::AlreadyRunning { job_id: job.job_id });
        }

        let job_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(None);

        *state = JobState::Running(ActiveJob {
            job_id,
            source: source.clone(),
            target: target.clone(),
            pid: None,
            cancel: cancel.clone(),
            finished: finished_rx,
        });
        drop(state);

        debug!(%job_id, source = %source.display(), target = %target.display(), "Job reserved");

        Ok(JobTicket {
            job_id,
            source,
            target,
            cancel,
            finished: Some(finished_tx),
            state: self.state.clone(),
            log: self.log.clone(),
            command: self.command.clone(),
        })
    }

    /// Run a backup to completion. Blocks (asynchronously) for the whole
    /// transfer.
    pub async fn start(
        &self,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Result<JobOutcome, BackupError> {
        self.begin(source, target)?.run().await
    }

    /// Stop the running job, if any.
    ///
    /// Sends SIGTERM, escalates to SIGKILL after [`CANCEL_GRACE`], and
    /// returns once the job has reported back. Returns `false` when idle.
    pub async fn cancel(&self) -> bool {
        let (job_id, token, mut finished) = {
            let state = lock(&self.state);
            match &*state {
                JobState::Idle => {
                    self.log.push("No backup to cancel");
                    return false;
                }
                JobState::Running(job) => (job.job_id, job.cancel.clone(), job.finished.clone()),
            }
        };

        self.log.push("Cancelling backup...");
        token.cancel();

        match timeout(CANCEL_GRACE + CANCEL_MARGIN, finished.wait_for(Option::is_some)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => debug!(%job_id, "Job dropped before reporting an outcome"),
            Err(_) => warn!(%job_id, "Job did not report back after cancellation"),
        }

        true
    }

    pub fn status(&self) -> BackupStatus {
        let active = matches!(&*lock(&self.state), JobState::Running(job) if job.pid.is_some());
        BackupStatus {
            active,
            message: if active { "Backup in progress" } else { "Idle" }.to_string(),
        }
    }

    /// True from reservation until the job returns to idle.
    pub fn is_busy(&self) -> bool {
        matches!(&*lock(&self.state), JobState::Running(_))
    }

    pub fn current_job(&self) -> Option<JobInfo> {
        match &*lock(&self.state) {
            JobState::Idle => None,
            JobState::Running(job) => Some(JobInfo {
                job_id: job.job_id,
                source: job.source.clone(),
                target: job.target.clone(),
                pid: job.pid,
            }),
        }
    }
}

/// A reserved job. Running it consumes the ticket; dropping it unrun
/// releases the reservation.
pub struct JobTicket {
    job_id: Uuid,
    source: PathBuf,
    target: PathBuf,
    cancel: CancellationToken,
    finished: Option<watch::Sender<Option<JobOutcome>>>,
    state: Arc<Mutex<JobState>>,
    log: LogSink,
    command: Arc<SyncCommand>,
}

impl JobTicket {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub async fn run(mut self) -> Result<JobOutcome, BackupError> {
        let result = self.execute().await;

        let outcome = match &result {
            Ok(outcome) => *outcome,
            Err(e) => {
                // Reported to the activity log by the caller.
                debug!(job_id = %self.job_id, error = %e, "Backup failed");
                JobOutcome::Failed
            }
        };
        self.finish(outcome);

        result
    }

    async fn execute(&mut self) -> Result<JobOutcome, BackupError> {
        if self.cancel.is_cancelled() {
            self.log.push("Backup cancelled before it started.");
            return Ok(JobOutcome::Cancelled);
        }

        tokio::fs::create_dir_all(&self.target)
            .await
            .map_err(|source| BackupError::TargetDir {
                path: self.target.clone(),
                source,
            })?;

        if self.cancel.is_cancelled() {
            self.log.push("Backup cancelled before it started.");
            return Ok(JobOutcome::Cancelled);
        }

        let command_line = self.command.describe(&self.source, &self.target);
        info!(job_id = %self.job_id, command = %command_line, "Starting backup");
        self.log.push(format!("Starting backup: {}", command_line));

        let (mut child, output) = self.spawn().map_err(|source| BackupError::Launch {
            command: command_line.clone(),
            source,
        })?;

        let pid = child.id();
        self.set_pid(pid);

        let mut drain = tokio::spawn(drain_output(output, self.log.clone()));

        let mut cancelled = false;
        let waited = tokio::select! {
            status = child.wait() => status,
            _ = self.cancel.cancelled() => {
                cancelled = true;
                terminate(&mut child, pid).await
            }
        };
        self.set_pid(None);

        match timeout(DRAIN_SETTLE, &mut drain).await {
            Ok(Ok(Ok(lines))) => debug!(job_id = %self.job_id, lines, "Output drained"),
            Ok(Ok(Err(e))) => warn!(job_id = %self.job_id, error = %e, "Error reading backup output"),
            Ok(Err(e)) => warn!(job_id = %self.job_id, error = %e, "Output reader task failed"),
            Err(_) => {
                warn!(job_id = %self.job_id, "Output stream still open after exit, detaching");
                drain.abort();
            }
        }

        let status = waited.map_err(|source| BackupError::Wait {
            command: command_line.clone(),
            source,
        })?;

        if cancelled {
            info!(job_id = %self.job_id, %status, "Backup cancelled");
            self.log.push("Backup cancelled.");
            return Ok(JobOutcome::Cancelled);
        }

        classify(status, command_line).inspect(|_| {
            info!(job_id = %self.job_id, "Backup completed");
            self.log.push("Backup completed successfully.");
        })
    }

    /// Launch the sync tool with stdout and stderr sharing one pipe.
    fn spawn(&self) -> io::Result<(Child, pipe::Receiver)> {
        let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        let output = pipe::Receiver::from_owned_fd(read_end)?;

        // The command is dropped at the end of this block so the parent holds
        // no write end; the reader then sees EOF once the child side closes.
        let child = {
            let stderr_end: OwnedFd = write_end.try_clone()?;
            let mut cmd = Command::new(&self.command.program);
            cmd.args(&self.command.args)
                .arg(SyncCommand::source_arg(&self.source))
                .arg(&self.target)
                .stdin(Stdio::null())
                .stdout(Stdio::from(write_end))
                .stderr(Stdio::from(stderr_end))
                .process_group(0)
                .kill_on_drop(true);
            cmd.spawn()?
        };

        Ok((child, output))
    }

    fn set_pid(&self, pid: Option<u32>) {
        if let JobState::Running(job) = &mut *lock(&self.state) {
            if job.job_id == self.job_id {
                job.pid = pid;
            }
        }
    }

    /// Return the executor to idle, then notify cancel waiters.
    fn finish(&mut self, outcome: JobOutcome) {
        let Some(finished) = self.finished.take() else {
            return;
        };

        {
            let mut state = lock(&self.state);
            if matches!(&*state, JobState::Running(job) if job.job_id == self.job_id) {
                *state = JobState::Idle;
            }
        }

        debug!(job_id = %self.job_id, ?outcome, "Job finished");
        finished.send_replace(Some(outcome));
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        if self.finished.is_some() {
            let outcome = if self.cancel.is_cancelled() {
                JobOutcome::Cancelled
            } else {
                JobOutcome::Failed
            };
            self.finish(outcome);
        }
    }
}

fn classify(status: ExitStatus, command: String) -> Result<JobOutcome, BackupError> {
    if status.success() {
        Ok(JobOutcome::Completed)
    } else {
        Err(BackupError::Failed {
            code: status.code(),
            status: status.to_string(),
            command,
        })
    }
}

/// SIGTERM the process group, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child, pid: Option<u32>) -> io::Result<ExitStatus> {
    let group = pid.map(|p| Pid::from_raw(p as i32));

    if let Some(group) = group {
        if let Err(e) = signal::killpg(group, Signal::SIGTERM) {
            debug!(error = %e, "SIGTERM to process group failed");
        }
    }

    match timeout(CANCEL_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(pid = ?pid, "Backup ignored SIGTERM, killing");
            if let Some(group) = group {
                let _ = signal::killpg(group, Signal::SIGKILL);
            }
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Forward every `\n`- or `\r`-terminated line to the log, verbatim,
/// blank lines included. `\r\n` ends a single line.
async fn drain_output<R: AsyncRead + Unpin>(reader: R, log: LogSink) -> io::Result<u64> {
    let mut reader = BufReader::new(reader);
    let mut pending = Vec::new();
    let mut after_cr = false;
    let mut lines = 0;

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            break;
        }

        let len = chunk.len();
        for &byte in chunk {
            match byte {
                b'\n' if after_cr => {}
                b'\n' | b'\r' => {
                    log.push_output(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                    lines += 1;
                }
                _ => pending.push(byte),
            }
            after_cr = byte == b'\r';
        }
        reader.consume(len);
    }

    if !pending.is_empty() {
        log.push_output(String::from_utf8_lossy(&pending).into_owned());
        lines += 1;
    }

    Ok(lines)
}

fn lock(state: &Mutex<JobState>) -> MutexGuard<'_, JobState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_gets_single_trailing_slash() {
        assert_eq!(
            SyncCommand::source_arg(Path::new("/media/card")),
            OsString::from("/media/card/")
        );
        assert_eq!(
            SyncCommand::source_arg(Path::new("/media/card/")),
            OsString::from("/media/card/")
        );
    }

    #[test]
    fn describes_full_command_line() {
        let cmd = SyncCommand::default();
        assert_eq!(
            cmd.describe(Path::new("/media/card"), Path::new("/backups/x")),
            "rsync -av --info=progress2 /media/card/ /backups/x"
        );
    }

    #[tokio::test]
    async fn drain_splits_on_newline_and_carriage_return() {
        let log = LogSink::new();
        let input: &[u8] = b"sending incremental file list\n  1,024  50%\r  2,048 100%\r\nfile1.txt\npartial";

        let lines = drain_output(input, log.clone()).await.unwrap();

        assert_eq!(lines, 5);
        assert_eq!(
            log.messages(),
            vec![
                "sending incremental file list",
                "  1,024  50%",
                "  2,048 100%",
                "file1.txt",
                "partial",
            ]
        );
    }

    #[tokio::test]
    async fn drain_keeps_blank_lines() {
        let log = LogSink::new();
        let input: &[u8] = b"header\n\nbody\r\n\r\n\nend\n";

        let lines = drain_output(input, log.clone()).await.unwrap();

        assert_eq!(lines, 6);
        assert_eq!(log.messages(), vec!["header", "", "body", "", "", "end"]);
    }

    #[test]
    fn begin_is_exclusive_until_ticket_dropped() {
        let executor = BackupExecutor::new(SyncCommand::default(), LogSink::new());

        let ticket = executor.begin("/src", "/dst").unwrap();
        assert!(executor.is_busy());
        assert!(!executor.status().active);

        let err = executor.begin("/other", "/dst2").err().unwrap();
        assert!(err.is_already_running());
        assert_eq!(executor.current_job().unwrap().source, PathBuf::from("/src"));

        drop(ticket);
        assert!(!executor.is_busy());
        assert!(executor.begin("/other", "/dst2").is_ok());
    }

    #[test]
    fn concurrent_begin_admits_exactly_one() {
        let executor = BackupExecutor::new(SyncCommand::default(), LogSink::new());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let executor = executor.clone();
                std::thread::spawn(move || {
                    executor
                        .begin(format!("/src{i}"), "/dst")
                        .map(std::mem::forget)
                        .is_ok()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn cancel_when_idle_is_noop() {
        let log = LogSink::new();
        let executor = BackupExecutor::new(SyncCommand::default(), log.clone());
        assert!(!executor.cancel().await);
        assert_eq!(executor.status().message, "Idle");
        assert_eq!(log.messages(), vec!["No backup to cancel"]);
    }

    #[tokio::test]
    async fn cancel_before_run_short_circuits() {
        let executor = BackupExecutor::new(SyncCommand::default(), LogSink::new());
        let ticket = executor.begin("/src", "/nonexistent/dst").unwrap();

        let canceller = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.cancel().await })
        };
        // Let the cancel request land before the ticket runs.
        while !ticket.cancel.is_cancelled() {
            tokio::task::yield_now().await;
        }

        assert_eq!(ticket.run().await.unwrap(), JobOutcome::Cancelled);
        assert!(canceller.await.unwrap());
        assert!(!executor.is_busy());
    }
}
