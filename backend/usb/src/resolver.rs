//! Mass-storage filtering and catalog-to-guard correlation. Pure functions.

use std::collections::BTreeSet;

use usbcage_core::{DeviceDescriptor, GuardRecord, IdentityKey};

/// A resolved device with its current guard ID, if the guard has seen it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardLookup {
    pub device: DeviceDescriptor,
    /// `None` while the guard daemon has not enumerated the device yet; retry.
    pub guard_id: Option<String>,
}

/// Keep mass-storage devices, preserving catalog order.
pub fn resolve(catalog: &[DeviceDescriptor]) -> Vec<DeviceDescriptor> {
    catalog
        .iter()
        .filter(|d| d.is_mass_storage())
        .cloned()
        .collect()
}

/// Join devices against the guard inventory on identity key.
pub fn lookup_guard_identity(devices: &[DeviceDescriptor], inventory: &[GuardRecord]) -> Vec<GuardLookup> {
    devices
        .iter()
        .map(|device| {
            let identity = device.identity();
            let guard_id = inventory
                .iter()
                .find(|record| record.identity == identity)
                .map(|record| record.guard_id.clone());
            GuardLookup { device: device.clone(), guard_id }
        })
        .collect()
}

/// Distinct identity keys of `devices`.
pub fn identity_keys(devices: &[DeviceDescriptor]) -> BTreeSet<IdentityKey> {
    devices.iter().map(DeviceDescriptor::identity).collect()
}
