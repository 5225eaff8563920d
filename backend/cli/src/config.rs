use std::path::{Path, PathBuf};

use anyhow::Result;

use usbcage_config::{apply_env_overrides, config_dir, config_file_path, load_config, CageConfig};

/// Flags that override the file and environment.
#[derive(Debug, Default, Clone)]
pub struct FlagOverrides {
    pub config_path: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

/// Runtime configuration after every layer has been applied.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub config: CageConfig,
    pub log_dir: PathBuf,
}

/// Defaults, then the YAML file, then environment, then flags.
pub async fn load_effective(flags: &FlagOverrides) -> Result<EffectiveConfig> {
    let dir = config_dir();
    let path = flags.config_path.clone().unwrap_or_else(|| config_file_path(&dir));
    let config = apply_env_overrides(load_config(&path).await?);
    Ok(finish(config, flags, &dir))
}

fn finish(mut config: CageConfig, flags: &FlagOverrides, dir: &Path) -> EffectiveConfig {
    if let Some(state_dir) = &flags.state_dir {
        config.state_dir = state_dir.clone();
    }
    let log_dir = config.log_dir.clone().unwrap_or_else(|| dir.join("logs"));
    EffectiveConfig { config, log_dir }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dir_flag_wins_and_log_dir_defaults_under_config_dir() {
        let flags = FlagOverrides { config_path: None, state_dir: Some(PathBuf::from("/var/lib/usbcage")) };
        let effective = finish(CageConfig::default(), &flags, Path::new("/home/u/.usbcage"));
        assert_eq!(effective.config.state_dir, PathBuf::from("/var/lib/usbcage"));
        assert_eq!(effective.log_dir, PathBuf::from("/home/u/.usbcage/logs"));
    }

    #[test]
    fn configured_log_dir_is_kept() {
        let config = CageConfig { log_dir: Some(PathBuf::from("/tmp/logs")), ..CageConfig::default() };
        let effective = finish(config, &FlagOverrides::default(), Path::new("/ignored"));
        assert_eq!(effective.log_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(effective.config.state_dir, PathBuf::from("."));
    }

    #[tokio::test]
    async fn explicit_config_path_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cage.yaml");
        std::fs::write(&path, "state_dir: /srv/cage\nrequired_group: usbpass\n").unwrap();
        let flags = FlagOverrides { config_path: Some(path), state_dir: None };
        let effective = load_effective(&flags).await.unwrap();
        assert_eq!(effective.config.required_group, "usbpass");
    }
}
