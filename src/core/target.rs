//! Destination directory derivation.
//!
//! The backup folder is named after the oldest file on the card, so a card
//! that sat in a camera for a week still lands in the folder of the day the
//! first photo was taken.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::hardware::Device;
use super::template::{expand_home, render};
use crate::logging::LogThrottle;

#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub earliest: Option<SystemTime>,
    pub files_seen: u64,
    /// Entries whose timestamp could not be read.
    pub warnings: u64,
}

pub struct TargetPathResolver {
    template: String,
}

impl TargetPathResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Derive the destination for backing up `source` from `device`.
    ///
    /// Nothing is created on disk here.
    pub async fn resolve(&self, device: &Device, source: &Path) -> PathBuf {
        let root = source.to_path_buf();
        let summary = tokio::task::spawn_blocking(move || scan_earliest_mtime(&root))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Source scan aborted");
                ScanSummary::default()
            });

        let timestamp: DateTime<Local> = match summary.earliest {
            Some(mtime) => mtime.into(),
            None => {
                debug!(source = %source.display(), "No readable files, using current time");
                Local::now()
            }
        };

        self.render_for(device, timestamp)
    }

    /// Fill the template for a known timestamp.
    pub fn render_for(&self, device: &Device, timestamp: DateTime<Local>) -> PathBuf {
        let date = timestamp.format("%Y%m%d").to_string();
        let hour = timestamp.format("%H").to_string();
        let minute = timestamp.format("%M").to_string();
        let uuid_short = device.uuid_short();

        let rendered = render(
            &self.template,
            &[
                ("date", &date),
                ("hour", &hour),
                ("minute", &minute),
                ("uuid", device.uuid()),
                ("uuid_short", &uuid_short),
            ],
        );

        expand_home(&rendered)
    }
}

/// Walk every regular file beneath `root` and keep the oldest readable
/// modification time. Unreadable entries are skipped.
pub fn scan_earliest_mtime(root: &Path) -> ScanSummary {
    let throttle = LogThrottle::new(Duration::from_secs(1));
    let mut summary = ScanSummary::default();

    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                summary.warnings += 1;
                if throttle.should_log() {
                    warn!(error = %e, "Skipping unreadable entry during scan");
                }
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let mtime = entry
            .metadata()
            .map_err(std::io::Error::from)
            .and_then(|m| m.modified());

        match mtime {
            Ok(mtime) => {
                summary.files_seen += 1;
                if summary.earliest.is_none_or(|earliest| mtime < earliest) {
                    summary.earliest = Some(mtime);
                }
            }
            Err(e) => {
                summary.warnings += 1;
                if throttle.should_log() {
                    warn!(path = %entry.path().display(), error = %e, "Could not read modification time");
                }
            }
        }
    }

    if summary.warnings > 0 {
        warn!(
            root = %root.display(),
            skipped = summary.warnings,
            "Some entries were skipped while scanning for the oldest file"
        );
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hardware::usb_card;
    use chrono::TimeZone;
    use filetime::{FileTime, set_file_mtime};
    use tempfile::tempdir;

    fn write_with_mtime(path: &Path, secs: i64) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"x").unwrap();
        set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    fn local(secs: i64) -> DateTime<Local> {
        Local.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn uses_oldest_file_in_tree() {
        let dir = tempdir().unwrap();
        let t1 = 1_600_000_000; // 2020-09-13
        let t2 = t1 + 86_400 * 40;
        let t3 = t1 + 86_400 * 400;

        write_with_mtime(&dir.path().join("b.jpg"), t2);
        write_with_mtime(&dir.path().join("DCIM/100/a.jpg"), t1);
        write_with_mtime(&dir.path().join("DCIM/101/c.jpg"), t3);

        let resolver = TargetPathResolver::new("/backups/{date}-{hour}{minute}");
        let path = resolver
            .resolve(&usb_card("/dev/sdb1", "ABCD-1234"), dir.path())
            .await;

        let expected = local(t1).format("/backups/%Y%m%d-%H%M").to_string();
        assert_eq!(path, PathBuf::from(expected));
    }

    #[tokio::test]
    async fn empty_source_uses_current_time() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("empty/nested")).unwrap();

        let resolver = TargetPathResolver::new("/backups/{date}");
        let before = Local::now();
        let path = resolver
            .resolve(&usb_card("/dev/sdb1", "ABCD-1234"), dir.path())
            .await;
        let after = Local::now();

        let candidates = [
            before.format("/backups/%Y%m%d").to_string(),
            after.format("/backups/%Y%m%d").to_string(),
        ];
        assert!(candidates.contains(&path.to_string_lossy().to_string()));
    }

    #[tokio::test]
    async fn missing_source_falls_back_to_now() {
        let resolver = TargetPathResolver::new("/backups/{uuid_short}");
        let path = resolver
            .resolve(
                &usb_card("/dev/sdb1", "ABCD-1234"),
                Path::new("/nonexistent/sdbackup-test"),
            )
            .await;
        assert_eq!(path, PathBuf::from("/backups/ABCD"));
    }

    #[test]
    fn renders_all_placeholders_and_home() {
        let resolver =
            TargetPathResolver::new("~/b/{uuid}/{uuid_short}/{date}/{hour}-{minute}");
        let ts = Local.with_ymd_and_hms(2023, 7, 4, 9, 5, 0).unwrap();

        let path = resolver.render_for(&usb_card("/dev/sdb1", "1A2B-3C4D"), ts);

        let home = dirs::home_dir().unwrap();
        assert_eq!(path, home.join("b/1A2B-3C4D/1A2B/20230704/09-05"));
    }

    #[test]
    fn scan_counts_files_and_keeps_minimum() {
        let dir = tempdir().unwrap();
        write_with_mtime(&dir.path().join("x"), 2_000_000_000);
        write_with_mtime(&dir.path().join("y/z"), 1_000_000_000);

        let summary = scan_earliest_mtime(dir.path());
        assert_eq!(summary.files_seen, 2);
        assert_eq!(summary.warnings, 0);
        assert_eq!(
            summary.earliest,
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000))
        );
    }

    #[test]
    fn unreadable_directory_is_skipped_with_warning() {
        use std::os::unix::fs::PermissionsExt;

        if nix::unistd::Uid::effective().is_root() {
            eprintln!("Skipping: root can read any directory");
            return;
        }

        let dir = tempdir().unwrap();
        write_with_mtime(&dir.path().join("DCIM/a.jpg"), 2_000_000_000);
        write_with_mtime(&dir.path().join("DCIM/b.jpg"), 1_500_000_000);
        let locked = dir.path().join("LOCKED");
        write_with_mtime(&locked.join("oldest.jpg"), 1_000_000_000);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        let summary = scan_earliest_mtime(dir.path());
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(summary.warnings > 0);
        assert_eq!(summary.files_seen, 2);
        assert_eq!(
            summary.earliest,
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000))
        );
    }
}
