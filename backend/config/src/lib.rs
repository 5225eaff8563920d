//! `usbcage-config`: runtime configuration.
//!
//! Provides:
//! - Typed config schema with defaults for every field
//! - YAML loading from the config directory
//! - Environment overrides
//! - Validation with path-qualified errors

pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use env::{apply_env_overrides, apply_env_overrides_with};
pub use io::{config_dir, config_file_path, load_config};
pub use schema::{CageConfig, ToolsConfig};
pub use validation::{validate, ConfigValidationError, ValidationReport};

use anyhow::{bail, Result};

/// Validate a fully assembled config, logging warnings. Call after the
/// logger is up so the messages are not lost.
pub fn ensure_valid(config: &CageConfig) -> Result<()> {
    let report = validate(config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    if let Some(first) = report.errors.first() {
        for error in &report.errors {
            tracing::error!(path = %error.path, message = %error.message, "Config error");
        }
        bail!("{first} ({} error(s) total)", report.errors.len());
    }
    Ok(())
}
