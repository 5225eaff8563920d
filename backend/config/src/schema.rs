//! usbcage configuration schema.
//!
//! Every field has a default, so an empty or missing file is a valid config.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration, passed explicitly to every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CageConfig {
    /// Directory holding the recovery journals.
    pub state_dir: PathBuf,
    /// Rolling log directory. Defaults to `<config dir>/logs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub device_poll_interval_ms: u64,
    pub monitor_poll_interval_ms: u64,
    /// Privileged link toggle; exceeding it aborts the run.
    pub interface_toggle_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Consecutive catalog failures tolerated while waiting for a device.
    pub max_enumeration_failures: u32,
    /// Auto-discovery skips links starting with these. `lo` is always skipped.
    pub excluded_interface_prefixes: Vec<String>,
    /// Host group required for USB passthrough.
    pub required_group: String,
    /// `startvm --type` for the workstation.
    pub vm_start_type: String,
    pub tools: ToolsConfig,
}

/// Executable names (or absolute paths) of the host tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ToolsConfig {
    pub lsusb: String,
    pub usbguard: String,
    pub vboxmanage: String,
    pub ip: String,
    pub sudo: String,
}

impl Default for CageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("."),
            log_dir: None,
            log_level: "info".to_string(),
            device_poll_interval_ms: 5_000,
            monitor_poll_interval_ms: 1_000,
            interface_toggle_timeout_ms: 5_000,
            command_timeout_ms: 30_000,
            max_enumeration_failures: 3,
            excluded_interface_prefixes: vec!["docker".to_string()],
            required_group: "vboxusers".to_string(),
            vm_start_type: "gui".to_string(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            lsusb: "lsusb".to_string(),
            usbguard: "usbguard".to_string(),
            vboxmanage: "VBoxManage".to_string(),
            ip: "ip".to_string(),
            sudo: "sudo".to_string(),
        }
    }
}

impl CageConfig {
    pub fn device_poll_interval(&self) -> Duration {
        Duration::from_millis(self.device_poll_interval_ms)
    }

    pub fn monitor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }

    pub fn interface_toggle_timeout(&self) -> Duration {
        Duration::from_millis(self.interface_toggle_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
