//! Device catalog reader backed by `lsusb -v`.
//!
//! The verbose listing is one long stream of attribute lines. A record starts
//! at each `idVendor` line; repeated attribute lines inside a record (one
//! `bInterfaceClass` per interface, typically) are collapsed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use usbcage_core::{CageError, CommandRunner, CommandSpec, DeviceCatalog, DeviceDescriptor};

static ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(idVendor|idProduct|iSerial|bInterfaceClass)\s+(.*?)\s*$").unwrap()
});

static HEX_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0x([0-9a-fA-F]{4})\b").unwrap());

pub struct LsusbCatalog {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
}

impl LsusbCatalog {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>, timeout: Duration) -> Self {
        Self { runner, program: program.into(), timeout }
    }
}

#[async_trait]
impl DeviceCatalog for LsusbCatalog {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, CageError> {
        let spec = CommandSpec::new(&self.program, self.timeout).arg("-v");
        let output = self.runner.run(&spec).await.map_err(|e| {
            if e.is_missing_tool() {
                CageError::Enumeration(format!("{} is not installed", self.program))
            } else {
                CageError::Enumeration(e.to_string())
            }
        })?;

        // lsusb exits non-zero when some descriptors are unreadable without
        // root but still prints everything it could read.
        if !output.success() && output.stdout.trim().is_empty() {
            return Err(CageError::Enumeration(format!(
                "{} exited with status {}: {}",
                self.program,
                output.status,
                output.stderr.trim()
            )));
        }

        let devices = parse_verbose_listing(&output.stdout)?;
        debug!(count = devices.len(), "Enumerated USB devices");
        Ok(devices)
    }
}

/// Parse `lsusb -v` output into descriptors, one per `idVendor` record.
pub fn parse_verbose_listing(raw: &str) -> Result<Vec<DeviceDescriptor>, CageError> {
    let mut records: Vec<Vec<(String, String)>> = Vec::new();

    for line in raw.lines() {
        let Some(caps) = ATTRIBUTE_RE.captures(line) else {
            continue;
        };
        let key = caps[1].to_string();
        let value = caps[2].to_string();

        if key == "idVendor" {
            records.push(Vec::new());
        }
        let Some(current) = records.last_mut() else {
            warn!(attribute = %key, "Attribute before first idVendor; ignoring");
            continue;
        };
        if !current.iter().any(|(k, v)| *k == key && *v == value) {
            current.push((key, value));
        }
    }

    if records.is_empty() {
        return Err(CageError::Enumeration(
            "no idVendor markers in device listing".to_string(),
        ));
    }

    records
        .into_iter()
        .enumerate()
        .map(|(index, attrs)| build_descriptor(index, &attrs))
        .collect()
}

fn build_descriptor(index: usize, attrs: &[(String, String)]) -> Result<DeviceDescriptor, CageError> {
    let find = |key: &str| attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

    let vendor_id = find("idVendor")
        .and_then(hex_id)
        .ok_or_else(|| CageError::Enumeration(format!("device {index}: malformed idVendor")))?;
    let product_id = find("idProduct")
        .and_then(hex_id)
        .ok_or_else(|| CageError::Enumeration(format!("device {index}: missing idProduct")))?;

    // "iSerial  3 4C530001" -> "4C530001"; index 0 means no serial string
    let serial_number = find("iSerial")
        .map(|v| strip_descriptor_index(v).to_string())
        .unwrap_or_default();

    // "bInterfaceClass  8 Mass Storage" -> "MassStorage"
    let interface_classes: BTreeSet<String> = attrs
        .iter()
        .filter(|(k, _)| k == "bInterfaceClass")
        .map(|(_, v)| strip_descriptor_index(v).replace(char::is_whitespace, ""))
        .filter(|class| !class.is_empty())
        .collect();

    Ok(DeviceDescriptor {
        local_index: index,
        vendor_id,
        product_id,
        serial_number,
        interface_classes,
    })
}

fn hex_id(value: &str) -> Option<String> {
    HEX_ID_RE
        .captures(value)
        .map(|caps| caps[1].to_ascii_lowercase())
}

fn strip_descriptor_index(value: &str) -> &str {
    let value = value.trim();
    match value.split_once(char::is_whitespace) {
        Some((index, rest)) if index.chars().all(|c| c.is_ascii_digit()) => rest.trim(),
        None if value.chars().all(|c| c.is_ascii_digit()) => "",
        _ => value,
    }
}
