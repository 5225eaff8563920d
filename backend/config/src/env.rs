//! Environment overrides applied on top of the file config.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::schema::CageConfig;

pub const STATE_DIR_VAR: &str = "USBCAGE_STATE_DIR";
pub const LOG_LEVEL_VAR: &str = "USBCAGE_LOG_LEVEL";
pub const LOG_DIR_VAR: &str = "USBCAGE_LOG_DIR";

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: CageConfig) -> CageConfig {
    apply_env_overrides_with(config, &std::env::vars().collect())
}

/// Apply overrides from a provided map (useful for testing).
pub fn apply_env_overrides_with(mut config: CageConfig, env: &HashMap<String, String>) -> CageConfig {
    let get = |name: &str| env.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

    if let Some(dir) = get(STATE_DIR_VAR) {
        config.state_dir = PathBuf::from(dir);
    }
    if let Some(dir) = get(LOG_DIR_VAR) {
        config.log_dir = Some(PathBuf::from(dir));
    }
    if let Some(level) = get(LOG_LEVEL_VAR) {
        config.log_level = level.to_string();
    }
    config
}
