//! Idempotent mounting of attached cards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use super::hardware::Device;
use super::template::render;

pub const PROC_MOUNTS: &str = "/proc/mounts";

#[derive(Debug, Error)]
pub enum MountError {
    #[error("Failed to read mount table {path}: {source}")]
    MountTable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create mount point {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not run mount for {device}: {source}")]
    Spawn {
        device: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load simulated card {device}: {source}")]
    Simulated {
        device: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mount {device} {mount_point} failed ({status}): {detail}")]
    CommandFailed {
        device: PathBuf,
        mount_point: PathBuf,
        status: String,
        detail: String,
    },
}

/// The OS call that attaches a filesystem to a directory.
#[async_trait]
pub trait MountCommand: Send + Sync {
    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), MountError>;
}

/// Runs `mount <device> <dir>`.
pub struct SystemMount;

#[async_trait]
impl MountCommand for SystemMount {
    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), MountError> {
        let output = Command::new("mount")
            .arg(device)
            .arg(mount_point)
            .output()
            .await
            .map_err(|source| MountError::Spawn {
                device: device.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(MountError::CommandFailed {
                device: device.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                status: output.status.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

pub struct MountResolver {
    template: String,
    mount_table: PathBuf,
    command: Arc<dyn MountCommand>,
}

impl MountResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self::with_command(template, PROC_MOUNTS, Arc::new(SystemMount))
    }

    pub fn with_command(
        template: impl Into<String>,
        mount_table: impl Into<PathBuf>,
        command: Arc<dyn MountCommand>,
    ) -> Self {
        Self {
            template: template.into(),
            mount_table: mount_table.into(),
            command,
        }
    }

    /// Return where `device` is mounted, mounting it first if needed.
    pub async fn mount(&self, device: &Device) -> Result<PathBuf, MountError> {
        if let Some(existing) = self.find_mount(&device.node).await? {
            info!(
                device = %device.node.display(),
                mount_point = %existing.display(),
                "Device already mounted"
            );
            return Ok(existing);
        }

        let mount_point = PathBuf::from(render(&self.template, &[("uuid", device.uuid())]));

        tokio::fs::create_dir_all(&mount_point)
            .await
            .map_err(|source| MountError::CreateDir {
                path: mount_point.clone(),
                source,
            })?;

        info!(
            device = %device.node.display(),
            mount_point = %mount_point.display(),
            "Mounting device"
        );
        self.command.mount(&device.node, &mount_point).await?;

        Ok(mount_point)
    }

    /// Look the device node up in the live mount table.
    pub async fn find_mount(&self, node: &Path) -> Result<Option<PathBuf>, MountError> {
        let contents = tokio::fs::read_to_string(&self.mount_table)
            .await
            .map_err(|source| MountError::MountTable {
                path: self.mount_table.clone(),
                source,
            })?;

        let node_real = node.canonicalize().ok();

        for (source, target) in parse_mount_table(&contents) {
            let source = Path::new(&source);
            if source == node {
                return Ok(Some(PathBuf::from(target)));
            }
            // Tables may list /dev/disk/by-* symlinks instead of the node.
            if let (Some(node_real), Ok(source_real)) = (&node_real, source.canonicalize()) {
                if *node_real == source_real {
                    debug!(listed = %source.display(), "Matched mount entry via symlink");
                    return Ok(Some(PathBuf::from(target)));
                }
            }
        }

        Ok(None)
    }
}

/// `(source, mount point)` pairs from a `/proc/mounts`-format table.
fn parse_mount_table(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            Some((unescape_octal(source), unescape_octal(target)))
        })
        .collect()
}

/// Decode the `\040`-style escapes the kernel uses for whitespace and
/// backslashes in mount table fields.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(value) = bytes.get(i + 1..i + 4).and_then(octal_byte) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn octal_byte(digits: &[u8]) -> Option<u8> {
    digits.iter().try_fold(0u8, |acc, &d| match d {
        b'0'..=b'7' => acc.checked_mul(8)?.checked_add(d - b'0'),
        _ => None,
    })
}
