//! Config validation: collects every problem in one pass.

use thiserror::Error;

use crate::schema::CageConfig;

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError { path: path.into(), message: message.into() });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError { path: path.into(), message: message.into() });
    }
}

pub fn validate(config: &CageConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_intervals(config, &mut report);
    validate_tools(config, &mut report);
    validate_interfaces(config, &mut report);
    report
}

fn validate_intervals(config: &CageConfig, report: &mut ValidationReport) {
    for (path, value) in [
        ("device_poll_interval_ms", config.device_poll_interval_ms),
        ("monitor_poll_interval_ms", config.monitor_poll_interval_ms),
        ("interface_toggle_timeout_ms", config.interface_toggle_timeout_ms),
        ("command_timeout_ms", config.command_timeout_ms),
    ] {
        if value == 0 {
            report.error(path, "must be greater than zero");
        }
    }
    if config.monitor_poll_interval_ms > 60_000 {
        report.warn(
            "monitor_poll_interval_ms",
            "devices are re-blocked at most this long after the sandbox stops",
        );
    }
    if config.max_enumeration_failures == 0 {
        report.error("max_enumeration_failures", "must allow at least one attempt");
    }
}

fn validate_tools(config: &CageConfig, report: &mut ValidationReport) {
    let tools = &config.tools;
    for (name, value) in [
        ("lsusb", &tools.lsusb),
        ("usbguard", &tools.usbguard),
        ("vboxmanage", &tools.vboxmanage),
        ("ip", &tools.ip),
        ("sudo", &tools.sudo),
    ] {
        if value.trim().is_empty() {
            report.error(format!("tools.{name}"), "tool name cannot be empty");
        }
    }
    if config.required_group.trim().is_empty() {
        report.error("required_group", "group name cannot be empty");
    }
    if !matches!(config.vm_start_type.as_str(), "gui" | "headless" | "sdl" | "separate") {
        report.error("vm_start_type", "expected one of gui, headless, sdl, separate");
    }
}

fn validate_interfaces(config: &CageConfig, report: &mut ValidationReport) {
    if config.excluded_interface_prefixes.iter().any(|p| p.is_empty()) {
        report.error(
            "excluded_interface_prefixes",
            "an empty prefix would exclude every interface",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let report = validate(&CageConfig::default());
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn zero_interval_and_empty_tool_are_errors() {
        let mut config = CageConfig::default();
        config.monitor_poll_interval_ms = 0;
        config.tools.usbguard = " ".into();
        let report = validate(&config);
        let paths: Vec<_> = report.errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["monitor_poll_interval_ms", "tools.usbguard"]);
    }

    #[test]
    fn empty_exclusion_prefix_is_rejected() {
        let mut config = CageConfig::default();
        config.excluded_interface_prefixes.push(String::new());
        assert!(!validate(&config).is_valid());
    }
}
