pub mod executor;
pub mod hardware;
pub mod log_sink;
pub mod manual;
pub mod mount;
pub mod orchestrator;
pub mod target;
pub mod template;
pub mod watcher;

pub use executor::{BackupError, BackupExecutor, BackupStatus, JobOutcome, JobTicket, SyncCommand};
pub use hardware::{Device, HardwareMonitor, SupportedFilesystem};
pub use log_sink::{LogEntry, LogFollow, LogSink};
pub use manual::{ManualJob, ManualTrigger};
pub use mount::{MountCommand, MountError, MountResolver};
pub use orchestrator::Orchestrator;
pub use target::TargetPathResolver;
pub use watcher::{DeviceHandler, DeviceWatcher};
