use std::ffi::OsStr;
use std::os::fd::AsFd;
use std::sync::Mutex;
use std::sync::mpsc as std_mpsc;

use anyhow::{Context, anyhow};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::hardware::{Device, HardwareMonitor};

/// How often the listener wakes to check for cancellation.
const POLL_INTERVAL_MS: u16 = 500;

/// Block device hotplug events from the kernel via udev netlink.
pub struct UdevMonitor {
    cancel: Mutex<Option<CancellationToken>>,
}

impl Default for UdevMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl UdevMonitor {
    pub fn new() -> Self {
        Self {
            cancel: Mutex::new(None),
        }
    }
}

impl HardwareMonitor for UdevMonitor {
    fn start(&self, event_sender: mpsc::Sender<Device>) -> anyhow::Result<()> {
        let token = CancellationToken::new();
        let listener_token = token.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        std::thread::Builder::new()
            .name("udev-listener".to_string())
            .spawn(move || listen(event_sender, listener_token, ready_tx))
            .context("Failed to spawn udev listener thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("udev listener exited during startup"))?
            .context("Failed to open udev monitor")?;

        if let Ok(mut slot) = self.cancel.lock() {
            if let Some(previous) = slot.replace(token) {
                previous.cancel();
            }
        }

        info!("(UdevMonitor) Listening for block device events");
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut slot) = self.cancel.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }
}

/// Listener thread body. The udev socket is not `Send`, so it is created and
/// dropped on this thread.
fn listen(
    tx: mpsc::Sender<Device>,
    cancel: CancellationToken,
    ready: std_mpsc::Sender<std::io::Result<()>>,
) {
    let socket = match udev::MonitorBuilder::new()
        .and_then(|b| b.match_subsystem_devtype("block", "partition"))
        .and_then(|b| b.listen())
    {
        Ok(socket) => socket,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while !cancel.is_cancelled() {
        let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "Polling udev socket failed");
                break;
            }
        }

        for event in socket.iter() {
            let Some(device) = device_from_event(&event) else {
                continue;
            };
            debug!(device = %device.node.display(), action = %device.action, "udev event");

            if tx.blocking_send(device).is_err() {
                debug!("Event receiver closed, stopping udev listener");
                return;
            }
        }
    }

    debug!("udev listener stopped");
}

fn device_from_event(event: &udev::Event) -> Option<Device> {
    let node = match event.devnode() {
        Some(node) => node.to_path_buf(),
        None => {
            warn!(syspath = %event.syspath().display(), "Event without device node");
            return None;
        }
    };

    let action = match event.event_type() {
        udev::EventType::Add => "add",
        udev::EventType::Change => "change",
        udev::EventType::Remove => "remove",
        udev::EventType::Bind => "bind",
        udev::EventType::Unbind => "unbind",
        udev::EventType::Unknown => "unknown",
    };

    Some(Device {
        node,
        subsystem: lossy(event.subsystem()),
        action: action.to_string(),
        devtype: lossy(event.devtype()),
        bus: lossy(event.property_value("ID_BUS")),
        partition_number: event.sysnum().and_then(|n| u32::try_from(n).ok()),
        fs_type: lossy(event.property_value("ID_FS_TYPE")),
        fs_uuid: event
            .property_value("ID_FS_UUID")
            .map(|v| v.to_string_lossy().into_owned()),
    })
}

fn lossy(value: Option<&OsStr>) -> String {
    value
        .map(|v| v.to_string_lossy().into_owned())
        .unwrap_or_default()
}
