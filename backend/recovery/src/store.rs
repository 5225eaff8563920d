//! The two recovery journals: links brought down and devices allowed.
//!
//! Either file existing means a previous run has not been restored yet.

use std::path::{Path, PathBuf};

use tracing::info;

use usbcage_core::{CageError, IdentityKey};

use crate::journal::Journal;

pub const INTERFACES_FILE: &str = "interfaces.bin";
pub const ALLOWED_FILE: &str = "allowed_usbguard.bin";

#[derive(Debug, Clone)]
pub struct RecoveryLog {
    state_dir: PathBuf,
    interfaces: Journal<String>,
    allowed: Journal<String>,
}

impl RecoveryLog {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            interfaces: Journal::new(state_dir.join(INTERFACES_FILE)),
            allowed: Journal::new(state_dir.join(ALLOWED_FILE)),
            state_dir,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn interfaces_path(&self) -> &Path {
        self.interfaces.path()
    }

    pub fn allowed_path(&self) -> &Path {
        self.allowed.path()
    }

    pub fn is_dirty(&self) -> bool {
        self.interfaces.exists() || self.allowed.exists()
    }

    pub async fn record_interface_down(&self, name: &str) -> Result<(), CageError> {
        self.interfaces.append(name.to_string()).await?;
        info!(interface = %name, log = %self.interfaces.path().display(), "Recorded disconnected interface");
        Ok(())
    }

    pub async fn record_device_allowed(&self, identity: &IdentityKey) -> Result<(), CageError> {
        self.allowed.append(identity.to_string()).await?;
        info!(identity = %identity, log = %self.allowed.path().display(), "Recorded allowed device");
        Ok(())
    }

    /// Logged interfaces in the order they went down, deduplicated.
    pub async fn interfaces(&self) -> Result<Option<Vec<String>>, CageError> {
        Ok(self.interfaces.read_all().await?.map(dedup_in_order))
    }

    /// Logged identity keys, deduplicated in first-seen order.
    pub async fn allowed_devices(&self) -> Result<Option<Vec<IdentityKey>>, CageError> {
        let Some(raw) = self.allowed.read_all().await? else {
            return Ok(None);
        };
        let keys = dedup_in_order(raw)
            .into_iter()
            .map(|k| {
                k.parse::<IdentityKey>()
                    .map_err(|e| CageError::RecoveryLog(format!("{}: {e}", self.allowed.path().display())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(keys))
    }

    pub async fn clear_interfaces(&self) -> Result<(), CageError> {
        self.interfaces.remove().await
    }

    pub async fn clear_allowed(&self) -> Result<(), CageError> {
        self.allowed.remove().await
    }
}

fn dedup_in_order(items: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(items.len());
    for item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}
