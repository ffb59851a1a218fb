//! Hotplug watch loop.
//!
//! A [`HardwareMonitor`] pushes raw block device events into a channel; a
//! dedicated thread drains it, filters for backup candidates and runs the
//! handler for each match to completion before taking the next event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::hardware::{Device, HardwareMonitor};

const EVENT_BUFFER: usize = 32;

#[async_trait]
pub trait DeviceHandler: Send + Sync + 'static {
    async fn on_device(&self, device: Device) -> Result<()>;
}

pub struct DeviceWatcher {
    monitor: Arc<dyn HardwareMonitor>,
    runtime: Handle,
    running: Arc<AtomicBool>,
    thread: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DeviceWatcher {
    /// `runtime` drives the handler futures; the watch loop itself runs on
    /// its own OS thread.
    pub fn new(monitor: Arc<dyn HardwareMonitor>, runtime: Handle) -> Self {
        Self {
            monitor,
            runtime,
            running: Arc::new(AtomicBool::new(false)),
            thread: std::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start watching. A second call while running does nothing.
    pub fn start(&self, handler: Arc<dyn DeviceHandler>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Device watcher already running");
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        if let Err(e) = self.monitor.start(tx) {
            self.running.store(false, Ordering::SeqCst);
            return Err(e).context("Failed to start hardware monitor");
        }

        let running = self.running.clone();
        let runtime = self.runtime.clone();
        let spawned = std::thread::Builder::new()
            .name("device-watcher".to_string())
            .spawn(move || watch_loop(rx, running, runtime, handler));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.monitor.stop();
                self.running.store(false, Ordering::SeqCst);
                return Err(e).context("Failed to spawn device watcher thread");
            }
        };

        if let Ok(mut slot) = self.thread.lock() {
            *slot = Some(handle);
        }

        info!("Device watcher started");
        Ok(())
    }

    /// Ask the loop to exit.
    ///
    /// The loop only looks at the flag between events. Stopping the monitor
    /// closes the event channel, which is what wakes an idle loop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.monitor.stop();
        info!("Device watcher stopped");
    }

    /// Wait for the loop thread to exit. Call after [`stop`](Self::stop).
    pub fn join(&self) {
        let handle = self.thread.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Device watcher thread panicked");
            }
        }
    }
}

fn watch_loop(
    mut rx: mpsc::Receiver<Device>,
    running: Arc<AtomicBool>,
    runtime: Handle,
    handler: Arc<dyn DeviceHandler>,
) {
    info!("Starting device monitor loop...");

    while let Some(device) = rx.blocking_recv() {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        if !device.is_backup_candidate() {
            debug!(
                device = %device.node.display(),
                action = %device.action,
                bus = %device.bus,
                fs_type = %device.fs_type,
                "Ignoring device event"
            );
            continue;
        }

        info!(device = %device.node.display(), "[MATCH] Backup candidate attached");

        // Spawned so that a panicking handler surfaces as a JoinError here
        // instead of unwinding through the loop.
        let handler = handler.clone();
        let node = device.node.clone();
        let task = runtime.spawn(async move { handler.on_device(device).await });

        match runtime.block_on(task) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(device = %node.display(), error = %e, "Error in device callback"),
            Err(e) => error!(device = %node.display(), error = %e, "Device callback panicked"),
        }
    }

    debug!("Device monitor loop exited");
}
