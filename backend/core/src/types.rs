use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CageError;

/// Interface class reported by the catalog for USB mass-storage devices.
pub const MASS_STORAGE_CLASS: &str = "MassStorage";

static IDENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9a-fA-F]{4}):([0-9a-fA-F]{4})$").unwrap());

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});

/// `vendorId:productId` pair correlating a catalog device with a guard record.
///
/// Always stored lowercase so joins across tools are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(vendor_id: &str, product_id: &str) -> Result<Self, CageError> {
        format!("{vendor_id}:{product_id}").parse()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn vendor_id(&self) -> &str {
        &self.0[..4]
    }

    pub fn product_id(&self) -> &str {
        &self.0[5..]
    }
}

impl FromStr for IdentityKey {
    type Err = CageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !IDENTITY_RE.is_match(s) {
            return Err(CageError::Enumeration(format!(
                "malformed identity key {s:?}, expected vvvv:pppp"
            )));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for IdentityKey {
    type Error = CageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IdentityKey> for String {
    fn from(key: IdentityKey) -> Self {
        key.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One USB device as reported by the host enumerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub local_index: usize,
    pub vendor_id: String,
    pub product_id: String,
    pub serial_number: String,
    pub interface_classes: BTreeSet<String>,
}

impl DeviceDescriptor {
    pub fn identity(&self) -> IdentityKey {
        // vendor/product were validated as 4 hex digits when parsed
        IdentityKey(format!(
            "{}:{}",
            self.vendor_id.to_ascii_lowercase(),
            self.product_id.to_ascii_lowercase()
        ))
    }

    pub fn is_mass_storage(&self) -> bool {
        self.interface_classes.contains(MASS_STORAGE_CLASS)
    }
}

/// Guard-subsystem policy state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardState {
    Allowed,
    Blocked,
}

/// One row of the guard inventory. Never cached: guard IDs change when the
/// guard daemon restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardRecord {
    pub guard_id: String,
    pub identity: IdentityKey,
    pub state: GuardState,
}

/// A sandbox instance reference, classified once at the CLI boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxHandle {
    ByName(String),
    ByUuid(Uuid),
}

impl SandboxHandle {
    /// Classify a user-supplied identifier: hyphenated UUIDs address the
    /// instance by UUID, everything else by name.
    pub fn parse(raw: &str) -> Result<Self, CageError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CageError::Precondition(
                "sandbox identifier cannot be empty".to_string(),
            ));
        }
        if UUID_RE.is_match(raw) {
            let uuid = Uuid::parse_str(raw)
                .map_err(|e| CageError::Precondition(format!("invalid sandbox uuid: {e}")))?;
            return Ok(Self::ByUuid(uuid));
        }
        Ok(Self::ByName(raw.to_string()))
    }

    /// The value passed to the virtualization tool.
    pub fn as_arg(&self) -> String {
        match self {
            Self::ByName(name) => name.clone(),
            Self::ByUuid(uuid) => uuid.hyphenated().to_string(),
        }
    }

    pub fn is_uuid(&self) -> bool {
        matches!(self, Self::ByUuid(_))
    }
}

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByName(name) => write!(f, "{name}"),
            Self::ByUuid(uuid) => write!(f, "{{{uuid}}}"),
        }
    }
}

/// The sandbox instance(s) one run drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxTarget {
    /// Receives the USB device and is monitored for termination.
    pub workstation: SandboxHandle,
    /// Routes the workstation's traffic in pairing mode; started first.
    pub gateway: Option<SandboxHandle>,
}

impl SandboxTarget {
    pub fn single(workstation: SandboxHandle) -> Self {
        Self { workstation, gateway: None }
    }

    pub fn paired(workstation: SandboxHandle, gateway: SandboxHandle) -> Self {
        Self { workstation, gateway: Some(gateway) }
    }
}

/// Requested administrative state of a network link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

impl LinkState {
    pub fn as_arg(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

/// Result of a non-fatal interface toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// The link changed state and must be recorded for undo.
    Changed,
    /// Nothing to do: the link is missing or already in the requested state.
    Skipped { reason: String },
}
