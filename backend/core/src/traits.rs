use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::credential::Credential;
use crate::error::CageError;
use crate::types::{
    DeviceDescriptor, GuardRecord, IdentityKey, LinkState, SandboxHandle, ToggleOutcome,
};

/// Source of the host's attached USB devices.
#[async_trait]
pub trait DeviceCatalog: Send + Sync {
    /// All attached devices in enumerator order.
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, CageError>;
}

/// Host-side device-guard policy store.
#[async_trait]
pub trait GuardPolicy: Send + Sync {
    async fn is_installed(&self) -> bool;

    /// Full inventory, freshly queried.
    async fn list_devices(&self) -> Result<Vec<GuardRecord>, CageError>;

    /// Blocked records only.
    async fn list_blocked(&self) -> Result<Vec<GuardRecord>, CageError>;

    /// Allow every blocked device whose identity is in `keys`. Returns the
    /// records that actually transitioned; a failed transition is logged and
    /// left out.
    async fn allow(&self, keys: &BTreeSet<IdentityKey>) -> Result<Vec<GuardRecord>, CageError>;

    /// Block every device whose identity is in `keys`, re-resolving guard IDs
    /// at call time. Already-blocked devices count as success.
    async fn block(
        &self,
        keys: &BTreeSet<IdentityKey>,
    ) -> Result<Vec<(IdentityKey, Result<(), CageError>)>, CageError>;
}

/// Privileged network-link toggling.
#[async_trait]
pub trait InterfaceControl: Send + Sync {
    /// Names of every host link in kernel order.
    async fn list_interfaces(&self) -> Result<Vec<String>, CageError>;

    async fn set_state(&self, name: &str, state: LinkState) -> Result<ToggleOutcome, CageError>;
}

/// Virtualization tool wrapper.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Whether the invoking user may hand host USB devices to a sandbox.
    async fn user_has_usb_access(&self) -> Result<bool, CageError>;

    async fn enable_usb_controller(&self, handle: &SandboxHandle) -> Result<(), CageError>;

    async fn start(&self, handle: &SandboxHandle, headless: bool) -> Result<(), CageError>;

    /// Host-side USB UUIDs the virtualization tool knows for `identity`.
    async fn usb_uuids(&self, identity: &IdentityKey) -> Result<Vec<String>, CageError>;

    async fn attach_device(&self, handle: &SandboxHandle, device_uuid: &str) -> Result<(), CageError>;

    /// False for an instance that never started or does not exist.
    async fn is_running(&self, handle: &SandboxHandle) -> Result<bool, CageError>;
}

/// Supplies the privilege credential. Called once per privileged toggle;
/// implementations must not cache the secret.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self, purpose: &str) -> Result<Credential, CageError>;
}
