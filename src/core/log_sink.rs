//! Append-only activity log shared by the watcher, the executor and manual
//! triggers.
//!
//! Entries are opaque text lines. They are never mutated or removed; callers
//! page through them by sequence number, or follow them live.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Local>,
    pub message: String,
}

/// Thread-safe log sink.
///
/// Cloning is cheap; all clones share one underlying buffer. Appends from
/// different threads interleave in lock order.
#[derive(Clone)]
pub struct LogSink {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    live: broadcast::Sender<LogEntry>,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            live,
        }
    }

    /// Append a line and mirror it to tracing.
    pub fn push(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "sdbackup::activity", "{}", message);
        self.append(message);
    }

    /// Append a failure line. Mirrored at error level instead of info.
    pub fn push_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(target: "sdbackup::activity", "{}", message);
        self.append(message);
    }

    /// Append a line of subprocess output. Mirrored at debug level only.
    pub fn push_output(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!(target: "sdbackup::sync", "{}", line);
        self.append(line);
    }

    fn append(&self, message: String) {
        let mut entries = self.lock();
        let entry = LogEntry {
            seq: entries.len() as u64,
            timestamp: Local::now(),
            message,
        };
        entries.push(entry.clone());
        // Sent while holding the lock so live order matches stored order.
        let _ = self.live.send(entry);
    }

    /// All entries with `seq >= since`.
    pub fn since(&self, since: u64) -> Vec<LogEntry> {
        let entries = self.lock();
        let start = (since as usize).min(entries.len());
        entries[start..].to_vec()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream every entry with `seq >= since`: the stored backlog first,
    /// then new entries as they are appended.
    pub fn follow(&self, since: u64) -> LogFollow {
        // Subscribe before reading the backlog so nothing falls in between.
        let live = self.live.subscribe();
        let backlog = self.since(since).into();
        LogFollow {
            sink: self.clone(),
            live,
            backlog,
            next: since,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cursor over a [`LogSink`] returned by [`LogSink::follow`].
///
/// Entries come out in sequence order without gaps or repeats. A reader that
/// falls behind the live buffer catches up from the stored entries.
pub struct LogFollow {
    sink: LogSink,
    live: broadcast::Receiver<LogEntry>,
    backlog: VecDeque<LogEntry>,
    next: u64,
}

impl LogFollow {
    /// Wait for the next entry.
    pub async fn next(&mut self) -> Option<LogEntry> {
        loop {
            if let Some(entry) = self.backlog.pop_front() {
                self.next = entry.seq + 1;
                return Some(entry);
            }

            match self.live.recv().await {
                Ok(entry) if entry.seq < self.next => continue,
                Ok(entry) => {
                    self.next = entry.seq + 1;
                    return Some(entry);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, from = self.next, "Log follower lagged, catching up");
                    self.backlog = self.sink.since(self.next).into();
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
