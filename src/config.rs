use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_MOUNT_POINT_TEMPLATE: &str = "/media/sd-backup-{uuid}";
pub const DEFAULT_TARGET_PATH_TEMPLATE: &str = "~/backups/{date}";
const ENV_PREFIX: &str = "SDBACKUP_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where a card is mounted when it is not mounted already. `{uuid}`.
    pub mount_point_template: String,
    /// Backup destination. `{date}`, `{hour}`, `{minute}`, `{uuid}`,
    /// `{uuid_short}`; a leading `~` is expanded.
    pub target_path_template: String,
    pub rpc_bind: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    pub verbose: bool,
    pub json_logs: bool,
    pub simulation: bool,
    pub sync_program: String,
    pub sync_args: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mount_point_template: DEFAULT_MOUNT_POINT_TEMPLATE.to_string(),
            target_path_template: DEFAULT_TARGET_PATH_TEMPLATE.to_string(),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 9847)),
            log_path: None,
            verbose: false,
            json_logs: false,
            simulation: false,
            sync_program: "rsync".to_string(),
            sync_args: vec!["-av".to_string(), "--info=progress2".to_string()],
        }
    }
}

impl AppConfig {
    /// Layered load: defaults, then the TOML file (if present), then
    /// `SDBACKUP_*` environment variables, then CLI overrides.
    pub fn new<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        Self::from_figment(&figment)
    }

    /// Build a config from any figment.
    ///
    /// The two templates are read key by key: a missing, empty or non-string
    /// template falls back to its default without affecting the other keys.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let defaults = AppConfig::default();

        Ok(Self {
            mount_point_template: template_or_default(
                figment,
                "mount_point_template",
                DEFAULT_MOUNT_POINT_TEMPLATE,
            ),
            target_path_template: template_or_default(
                figment,
                "target_path_template",
                DEFAULT_TARGET_PATH_TEMPLATE,
            ),
            rpc_bind: match figment.find_value("rpc_bind") {
                Ok(_) => figment
                    .extract_inner("rpc_bind")
                    .context("Invalid rpc_bind address in config")?,
                Err(_) => defaults.rpc_bind,
            },
            log_path: figment.extract_inner("log_path").ok(),
            verbose: figment.extract_inner("verbose").unwrap_or(defaults.verbose),
            json_logs: figment
                .extract_inner("json_logs")
                .unwrap_or(defaults.json_logs),
            simulation: figment
                .extract_inner("simulation")
                .unwrap_or(defaults.simulation),
            sync_program: figment
                .extract_inner("sync_program")
                .unwrap_or(defaults.sync_program),
            sync_args: figment
                .extract_inner("sync_args")
                .unwrap_or(defaults.sync_args),
        })
    }

    /// Write this config as TOML, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        Ok(())
    }
}

fn template_or_default(figment: &Figment, key: &str, default: &str) -> String {
    match figment.extract_inner::<String>(key) {
        Ok(value) if !value.trim().is_empty() => value,
        Ok(_) => {
            warn!(key, default, "Empty template in config, using default");
            default.to_string()
        }
        Err(e) => {
            warn!(key, default, error = %e, "Invalid template in config, using default");
            default.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn from_json(value: serde_json::Value) -> AppConfig {
        let figment = Figment::from(Serialized::defaults(value));
        AppConfig::from_figment(&figment).unwrap()
    }

    #[test]
    fn empty_mapping_uses_defaults() {
        let config = from_json(json!({}));
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.mount_point_template, "/media/sd-backup-{uuid}");
        assert_eq!(config.target_path_template, "~/backups/{date}");
    }

    #[test]
    fn templates_are_read_from_mapping() {
        let config = from_json(json!({
            "mount_point_template": "/mnt/card-{uuid}",
            "target_path_template": "/srv/{uuid_short}/{date}-{hour}{minute}",
        }));
        assert_eq!(config.mount_point_template, "/mnt/card-{uuid}");
        assert_eq!(
            config.target_path_template,
            "/srv/{uuid_short}/{date}-{hour}{minute}"
        );
    }

    #[test]
    fn malformed_template_falls_back_independently() {
        let config = from_json(json!({
            "mount_point_template": 42,
            "target_path_template": "/data/{date}",
        }));
        assert_eq!(config.mount_point_template, DEFAULT_MOUNT_POINT_TEMPLATE);
        assert_eq!(config.target_path_template, "/data/{date}");

        let config = from_json(json!({ "target_path_template": "  " }));
        assert_eq!(config.target_path_template, DEFAULT_TARGET_PATH_TEMPLATE);
    }

    #[test]
    fn toml_file_and_overrides_layer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "target_path_template = \"/backups/{uuid}\"\nverbose = true\n",
        )
        .unwrap();

        #[derive(Serialize)]
        struct Overrides {
            rpc_bind: String,
        }

        let config = AppConfig::new(
            &path,
            Some(&Overrides {
                rpc_bind: "127.0.0.1:4000".to_string(),
            }),
        )
        .unwrap();

        assert_eq!(config.target_path_template, "/backups/{uuid}");
        assert!(config.verbose);
        assert_eq!(config.rpc_bind.port(), 4000);
        assert_eq!(config.mount_point_template, DEFAULT_MOUNT_POINT_TEMPLATE);
    }

    #[test]
    fn written_config_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc").join("config.toml");

        let config = AppConfig {
            target_path_template: "/srv/{date}".to_string(),
            ..Default::default()
        };
        config.write_to(&path).unwrap();

        let loaded = AppConfig::new(&path, None::<&()>).unwrap();
        assert_eq!(loaded.target_path_template, "/srv/{date}");
        assert_eq!(loaded.sync_program, "rsync");
    }
}
