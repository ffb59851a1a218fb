use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::hardware::{Device, HardwareMonitor};
use crate::core::mount::{MountCommand, MountError};

type SharedSender = Arc<Mutex<Option<mpsc::Sender<Device>>>>;

/// Controller half of the simulated monitor. Injected devices are delivered
/// only while the monitor is started.
#[derive(Clone)]
pub struct Simulator {
    tx: SharedSender,
}

impl Simulator {
    /// Deliver an arbitrary device event. Never blocks; returns `false` if
    /// the monitor is stopped or its buffer is full.
    pub fn inject(&self, device: Device) -> bool {
        let sender = self.tx.lock().ok().and_then(|slot| slot.clone());
        match sender {
            Some(tx) => tx.try_send(device).is_ok(),
            None => {
                debug!("(Simulator) Monitor not started, event dropped");
                false
            }
        }
    }

    /// Simulate inserting a qualifying card whose filesystem lives at
    /// `/tmp/test_<uuid>`.
    pub fn add_card(&self, uuid: &str) -> bool {
        self.inject(simulated_card(uuid))
    }

    /// Simulate removing a card.
    pub fn remove_card(&self, uuid: &str) -> bool {
        self.inject(Device {
            action: "remove".to_string(),
            ..simulated_card(uuid)
        })
    }
}

fn simulated_card(uuid: &str) -> Device {
    Device {
        node: PathBuf::from(format!("/tmp/test_{}", uuid)),
        subsystem: "block".to_string(),
        action: "add".to_string(),
        devtype: "partition".to_string(),
        bus: "usb".to_string(),
        partition_number: Some(1),
        fs_type: "exfat".to_string(),
        fs_uuid: Some(uuid.to_string()),
    }
}

pub struct SimulatedMonitor {
    tx: SharedSender,
}

impl SimulatedMonitor {
    pub fn new() -> (Self, Simulator) {
        let tx: SharedSender = Arc::new(Mutex::new(None));
        (Self { tx: tx.clone() }, Simulator { tx })
    }
}

impl HardwareMonitor for SimulatedMonitor {
    fn start(&self, event_sender: mpsc::Sender<Device>) -> anyhow::Result<()> {
        let mut slot = self
            .tx
            .lock()
            .map_err(|_| anyhow::anyhow!("simulated monitor state poisoned"))?;
        *slot = Some(event_sender);
        info!("(SimulatedMonitor) Listening for injected devices");
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut slot) = self.tx.lock() {
            slot.take();
        }
    }
}

/// Stands in for `mount(8)` in simulation mode.
///
/// A simulated card's device node is a plain directory holding the card's
/// files. "Mounting" copies that tree into the mount point, keeping
/// modification times. A missing node directory is an empty card.
pub struct SimulatedMount;

#[async_trait]
impl MountCommand for SimulatedMount {
    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), MountError> {
        info!(
            device = %device.display(),
            mount_point = %mount_point.display(),
            "(SimulatedMount) Loading card contents"
        );

        let card = device.to_path_buf();
        let dest = mount_point.to_path_buf();
        tokio::task::spawn_blocking(move || copy_card(&card, &dest))
            .await
            .map_err(io::Error::other)
            .and_then(|copied| copied)
            .map_err(|source| MountError::Simulated {
                device: device.to_path_buf(),
                source,
            })
    }
}

fn copy_card(card: &Path, dest: &Path) -> io::Result<()> {
    std::fs::create_dir_all(card)?;

    for entry in WalkDir::new(card).min_depth(1) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(card).map_err(io::Error::other)?;
        let out = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&out)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &out)?;
            let modified = entry.metadata().map_err(io::Error::from)?.modified()?;
            File::options().write(true).open(&out)?.set_modified(modified)?;
        }
    }

    Ok(())
}
