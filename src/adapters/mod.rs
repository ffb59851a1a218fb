use std::io::BufRead;
use std::sync::Arc;

use crate::core::hardware::HardwareMonitor;
use crate::core::mount::{MountCommand, SystemMount};

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::UdevMonitor;
pub use simulated::{SimulatedMonitor, SimulatedMount, Simulator};

/// Pick the hardware monitor for this run. In simulation mode cards are
/// injected from stdin: `add <uuid>` or `rm <uuid>`.
pub fn get_monitor(simulation: bool) -> Arc<dyn HardwareMonitor> {
    if simulation {
        return simulated_monitor_from(std::io::BufReader::new(std::io::stdin()));
    }

    #[cfg(target_os = "linux")]
    {
        Arc::new(UdevMonitor::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("No hotplug support on this platform, falling back to simulation");
        get_monitor(true)
    }
}

/// Simulated monitor driven by `add <uuid>` / `rm <uuid>` lines from `input`.
/// Lines are read on a background thread until `input` reaches EOF.
pub fn simulated_monitor_from<R>(input: R) -> Arc<dyn HardwareMonitor>
where
    R: BufRead + Send + 'static,
{
    let (monitor, controller) = SimulatedMonitor::new();

    std::thread::spawn(move || {
        for line in input.lines().map_while(Result::ok) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let uuid = parts.get(1).copied().unwrap_or("123");
            match parts.first().copied() {
                Some("add") => {
                    controller.add_card(uuid);
                }
                Some("rm") => {
                    controller.remove_card(uuid);
                }
                _ => println!("(Simulator) Use: 'add <uuid>' or 'rm <uuid>'"),
            }
        }
    });

    Arc::new(monitor)
}

/// How cards get mounted. Simulated cards are directories, not block
/// devices, so they are copied into place instead.
pub fn get_mount_command(simulation: bool) -> Arc<dyn MountCommand> {
    if simulation {
        Arc::new(SimulatedMount)
    } else {
        Arc::new(SystemMount)
    }
}
