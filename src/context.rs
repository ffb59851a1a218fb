use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::core::{BackupExecutor, LogSink, ManualTrigger, SyncCommand};

/// Everything the watcher, the manual trigger and the RPC layer share.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub log: LogSink,
    pub executor: BackupExecutor,
    pub manual: ManualTrigger,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let log = LogSink::new();
        let executor = BackupExecutor::new(
            SyncCommand {
                program: config.sync_program.clone(),
                args: config.sync_args.clone(),
            },
            log.clone(),
        );
        let manual = ManualTrigger::new(executor.clone(), log.clone());

        Self {
            config: Arc::new(config),
            log,
            executor,
            manual,
            started_at: Instant::now(),
        }
    }
}
