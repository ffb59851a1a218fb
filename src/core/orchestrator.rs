use std::path::Path;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::info;

use crate::adapters;
use crate::context::AppContext;
use crate::core::executor::JobOutcome;
use crate::core::hardware::Device;
use crate::core::mount::{MountResolver, PROC_MOUNTS};
use crate::core::target::TargetPathResolver;
use crate::core::watcher::DeviceHandler;

/// Automatic backup pipeline run for each matching card:
/// mount, resolve the destination, copy.
pub struct Orchestrator {
    ctx: AppContext,
    mounts: MountResolver,
    targets: TargetPathResolver,
}

impl Orchestrator {
    /// Mounts through `mount(8)`, or through [`adapters::SimulatedMount`]
    /// when the config enables simulation.
    pub fn new(ctx: AppContext) -> Self {
        let mounts = MountResolver::with_command(
            ctx.config.mount_point_template.clone(),
            PROC_MOUNTS,
            adapters::get_mount_command(ctx.config.simulation),
        );
        Self::with_mount_resolver(ctx, mounts)
    }

    pub fn with_mount_resolver(ctx: AppContext, mounts: MountResolver) -> Self {
        let targets = TargetPathResolver::new(ctx.config.target_path_template.clone());
        Self {
            ctx,
            mounts,
            targets,
        }
    }

    /// Run the pipeline for one device. Failures are logged, never returned.
    pub async fn handle_device_added(&self, device: Device) -> Option<JobOutcome> {
        let log = &self.ctx.log;
        info!(device = %device.node.display(), uuid = device.uuid(), "New card");
        log.push(format!("Device detected: {}", device.node.display()));

        match self.backup_device(&device).await {
            Ok(outcome) => {
                match outcome {
                    JobOutcome::Completed => log.push("Automatic backup completed"),
                    JobOutcome::Cancelled => log.push("Automatic backup cancelled"),
                    JobOutcome::Failed => log.push_error("Automatic backup failed"),
                }
                Some(outcome)
            }
            Err(e) => {
                log.push_error(format!("Automatic backup failed: {:#}", e));
                None
            }
        }
    }

    async fn backup_device(&self, device: &Device) -> Result<JobOutcome> {
        let log = &self.ctx.log;

        let mount_point = self.mounts.mount(device).await?;
        log.push(format!("Mounted at {}", mount_point.display()));

        let target = self.targets.resolve(device, &mount_point).await;
        log.push(format!("Target path resolved: {}", target.display()));

        ensure_outside(&mount_point, &target)?;

        log.push(format!("Starting automatic backup to {}", target.display()));
        let outcome = self.ctx.executor.start(&mount_point, &target).await?;

        Ok(outcome)
    }
}

#[async_trait]
impl DeviceHandler for Orchestrator {
    async fn on_device(&self, device: Device) -> Result<()> {
        self.handle_device_added(device).await;
        Ok(())
    }
}

/// Refuse to copy a card into itself.
fn ensure_outside(mount_point: &Path, target: &Path) -> Result<()> {
    if target.starts_with(mount_point) {
        bail!(
            "Target {} is inside the card mounted at {}",
            target.display(),
            mount_point.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::hardware::usb_card;
    use crate::core::mount::SystemMount;
    use crate::logging::CapturedLogs;
    use std::sync::Arc;

    #[tokio::test]
    async fn failure_is_reported_once_at_error_level() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(AppConfig {
            mount_point_template: format!("{}/sd-{{uuid}}", temp.path().display()),
            ..AppConfig::default()
        });
        let mounts = MountResolver::with_command(
            ctx.config.mount_point_template.clone(),
            temp.path().join("no-such-mount-table"),
            Arc::new(SystemMount),
        );
        let orchestrator = Orchestrator::with_mount_resolver(ctx.clone(), mounts);

        let (captured, _guard) = CapturedLogs::install("sdbackup=debug");
        let outcome = orchestrator
            .handle_device_added(usb_card("/dev/sdz1", "ABCD-1234"))
            .await;

        assert!(outcome.is_none());
        let output = captured.contents();
        let reports: Vec<&str> = output
            .lines()
            .filter(|line| line.contains("Automatic backup failed"))
            .collect();
        assert_eq!(reports.len(), 1, "output: {output}");
        assert!(reports[0].contains("ERROR"), "output: {output}");
        assert!(ctx
            .log
            .messages()
            .iter()
            .any(|m| m.starts_with("Automatic backup failed: Failed to read mount table")));
    }

    #[test]
    fn target_on_card_is_rejected() {
        let mount = Path::new("/media/sd-backup-1234");
        assert!(ensure_outside(mount, Path::new("/media/sd-backup-1234")).is_err());
        assert!(ensure_outside(mount, Path::new("/media/sd-backup-1234/backups")).is_err());
        assert!(ensure_outside(mount, Path::new("/media/sd-backup-12345/x")).is_ok());
        assert!(ensure_outside(mount, Path::new("/home/u/backups/20240101")).is_ok());
    }
}
