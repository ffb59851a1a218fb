use std::path::PathBuf;

use tokio::sync::mpsc;

/// Snapshot of a block device as reported by the OS for a single event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub node: PathBuf,
    pub subsystem: String,
    pub action: String,
    pub devtype: String,
    pub bus: String,
    pub partition_number: Option<u32>,
    pub fs_type: String,
    pub fs_uuid: Option<String>,
}

/// Filesystems accepted for automatic backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedFilesystem {
    Exfat,
    Fat32,
    Udf,
}

impl SupportedFilesystem {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "exfat" => Some(Self::Exfat),
            "fat32" => Some(Self::Fat32),
            "udf" => Some(Self::Udf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exfat => "exfat",
            Self::Fat32 => "fat32",
            Self::Udf => "udf",
        }
    }
}

impl Device {
    /// Filesystem UUID, or `"unknown"` when the device reports none.
    pub fn uuid(&self) -> &str {
        self.fs_uuid
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or("unknown")
    }

    /// First four characters of the UUID (fewer if the UUID is shorter).
    pub fn uuid_short(&self) -> String {
        self.uuid().chars().take(4).collect()
    }

    /// True for the first partition of a freshly attached USB card with a
    /// supported filesystem. Every field must qualify.
    pub fn is_backup_candidate(&self) -> bool {
        self.subsystem == "block"
            && self.action == "add"
            && self.devtype == "partition"
            && self.bus == "usb"
            && self.partition_number == Some(1)
            && SupportedFilesystem::from_str(&self.fs_type).is_some()
    }
}

pub trait HardwareMonitor: Send + Sync {
    /// Start listening for hardware events.
    /// Every observed block device event is pushed onto `event_sender`,
    /// unfiltered. Dropping the sender signals the end of the stream.
    fn start(&self, event_sender: mpsc::Sender<Device>) -> anyhow::Result<()>;

    /// Stop the monitor. Any sender handed to `start` is released so the
    /// receiving side observes a closed channel.
    fn stop(&self);
}

#[cfg(test)]
pub(crate) fn usb_card(node: &str, uuid: &str) -> Device {
    Device {
        node: PathBuf::from(node),
        subsystem: "block".to_string(),
        action: "add".to_string(),
        devtype: "partition".to_string(),
        bus: "usb".to_string(),
        partition_number: Some(1),
        fs_type: "exfat".to_string(),
        fs_uuid: Some(uuid.to_string()),
    }
}
