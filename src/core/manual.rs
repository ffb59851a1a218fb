//! Manually requested backups.
//!
//! The reservation is taken synchronously so the caller learns about a busy
//! executor immediately; the transfer itself runs on a tracked background
//! task.

use std::path::PathBuf;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::info;
use uuid::Uuid;

use super::executor::{BackupError, BackupExecutor, JobOutcome};
use super::log_sink::LogSink;

#[derive(Clone)]
pub struct ManualTrigger {
    executor: BackupExecutor,
    log: LogSink,
    tasks: TaskTracker,
}

/// Handle to a submitted manual backup.
pub struct ManualJob {
    pub job_id: Uuid,
    handle: JoinHandle<Result<JobOutcome, BackupError>>,
}

impl ManualJob {
    /// Wait for the transfer to finish. A panicked task counts as failed.
    pub async fn wait(self) -> JobOutcome {
        match self.handle.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) | Err(_) => JobOutcome::Failed,
        }
    }
}

impl ManualTrigger {
    pub fn new(executor: BackupExecutor, log: LogSink) -> Self {
        Self {
            executor,
            log,
            tasks: TaskTracker::new(),
        }
    }

    /// Reserve the executor and start copying `source` into `target` in the
    /// background.
    pub fn submit(
        &self,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Result<ManualJob, BackupError> {
        let ticket = match self.executor.begin(source, target) {
            Ok(ticket) => ticket,
            Err(e) => {
                self.log.push_error(format!("Failed to start backup: {}", e));
                return Err(e);
            }
        };

        let job_id = ticket.job_id();
        self.log.push(format!(
            "Starting backup from {} to {}",
            ticket.source().display(),
            ticket.target().display()
        ));

        let log = self.log.clone();
        let handle = self.tasks.spawn(async move {
            let result = ticket.run().await;
            match &result {
                Ok(JobOutcome::Completed) => log.push("Backup finished successfully"),
                Ok(JobOutcome::Cancelled) => log.push("Backup cancelled by user"),
                Ok(JobOutcome::Failed) => log.push_error("Backup failed"),
                Err(e) => log.push_error(format!("Backup failed: {}", e)),
            }
            result
        });

        Ok(ManualJob { job_id, handle })
    }

    /// Cancel whatever job is running, manual or automatic.
    pub async fn cancel(&self) -> bool {
        self.executor.cancel().await
    }

    /// Stop accepting work, cancel the running job and wait for manual
    /// tasks to wind down.
    pub async fn shutdown(&self) {
        self.tasks.close();
        if self.executor.is_busy() {
            info!("Cancelling running backup for shutdown");
            self.executor.cancel().await;
        }
        self.tasks.wait().await;
    }
}
