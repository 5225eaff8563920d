//! Config file discovery and loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, info};

use crate::schema::CageConfig;

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Resolve the usbcage config directory.
/// Priority: `USBCAGE_CONFIG_DIR` env > `~/.usbcage/` > `./.usbcage`
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("USBCAGE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|home| home.join(".usbcage"))
        .unwrap_or_else(|| PathBuf::from(".usbcage"))
}

pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Load and parse the config from disk.
///
/// Returns `Ok(Default::default())` if the file doesn't exist.
pub async fn load_config(path: &Path) -> Result<CageConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        return Ok(CageConfig::default());
    }

    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(CageConfig::default());
    }

    let config: CageConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse config YAML at: {}", path.display()))?;

    info!(path = %path.display(), "Loaded config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.yaml")).await.unwrap();
        assert_eq!(config, CageConfig::default());
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "state_dir: /var/lib/usbcage\nmonitor_poll_interval_ms: 250\ntools:\n  vboxmanage: /usr/bin/vboxmanage\n",
        )
        .unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/usbcage"));
        assert_eq!(config.monitor_poll_interval_ms, 250);
        assert_eq!(config.tools.vboxmanage, "/usr/bin/vboxmanage");
        assert_eq!(config.tools.usbguard, "usbguard");
        assert_eq!(config.device_poll_interval_ms, 5_000);
    }

    #[tokio::test]
    async fn malformed_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "device_poll_interval_ms: [not a number\n").unwrap();
        assert!(load_config(&path).await.is_err());
    }
}
