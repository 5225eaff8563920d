//! Undo a previous run from its recovery journals.
//!
//! Devices are re-blocked before any link comes back up: if a block fails the
//! links stay down, the journals stay on disk, and running restore again is
//! safe. Each journal is deleted only once its own phase fully succeeded.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{error, info, warn};

use usbcage_core::{CageError, GuardPolicy, IdentityKey, InterfaceControl, LinkState, ToggleOutcome};
use usbcage_logging::{EventLogger, LifecycleEvent};

use crate::store::RecoveryLog;

/// What one restore pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Exactly one of the two journals was missing.
    pub incomplete_state: bool,
    pub interfaces_reconnected: Vec<String>,
    pub interfaces_failed: Vec<String>,
    pub devices_blocked: Vec<IdentityKey>,
    pub devices_failed: Vec<IdentityKey>,
    /// Journal present but guard tooling missing; guard state left untouched.
    pub guard_skipped: bool,
    /// Links left down because a device could not be re-blocked.
    pub reconnect_withheld: bool,
    pub interfaces_log_cleared: bool,
    pub allowed_log_cleared: bool,
}

impl RestoreReport {
    /// Nothing left to undo.
    pub fn is_clean(&self) -> bool {
        self.interfaces_failed.is_empty()
            && self.devices_failed.is_empty()
            && !self.guard_skipped
            && !self.reconnect_withheld
    }
}

pub struct Restorer {
    log: RecoveryLog,
    network: Arc<dyn InterfaceControl>,
    guard: Arc<dyn GuardPolicy>,
}

impl Restorer {
    pub fn new(log: RecoveryLog, network: Arc<dyn InterfaceControl>, guard: Arc<dyn GuardPolicy>) -> Self {
        Self { log, network, guard }
    }

    /// Run one restore pass. Fatal errors (a rejected credential) abort with
    /// the journals untouched; everything else is reported.
    pub async fn restore(&self) -> Result<RestoreReport, CageError> {
        let interfaces = self.log.interfaces().await?;
        let allowed = self.log.allowed_devices().await?;
        let mut report = RestoreReport::default();

        if interfaces.is_none() && allowed.is_none() {
            info!(state_dir = %self.log.state_dir().display(), "No recovery journals; nothing to restore");
            return Ok(report);
        }
        if interfaces.is_none() || allowed.is_none() {
            report.incomplete_state = true;
            warn!(
                error = %CageError::RestoreIncomplete(format!(
                    "{} present, {} present",
                    if interfaces.is_some() { "interfaces log" } else { "no interfaces log" },
                    if allowed.is_some() { "allow log" } else { "no allow log" },
                )),
                "At least one recovery journal is missing; restoring what exists"
            );
        }

        if let Some(keys) = allowed {
            self.reblock(keys, &mut report).await?;
        }
        if let Some(names) = interfaces {
            if !report.devices_failed.is_empty() {
                report.reconnect_withheld = true;
                error!(
                    devices = ?report.devices_failed,
                    "Devices could not be re-blocked; leaving network interfaces down"
                );
            } else {
                self.reconnect(names, &mut report).await?;
            }
        }

        EventLogger::log_event(LifecycleEvent::RestoreCompleted {
            interfaces: report.interfaces_reconnected.len(),
            devices: report.devices_blocked.len(),
            complete: report.is_clean() && !report.incomplete_state,
        });
        Ok(report)
    }

    async fn reblock(&self, keys: Vec<IdentityKey>, report: &mut RestoreReport) -> Result<(), CageError> {
        if !self.guard.is_installed().await {
            warn!("usbguard is not installed; leaving guard state untouched");
            report.guard_skipped = true;
            return Ok(());
        }
        let wanted: BTreeSet<IdentityKey> = keys.into_iter().collect();
        let results = match self.guard.block(&wanted).await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, "Could not query usbguard; devices remain in the allow log");
                report.devices_failed.extend(wanted);
                return Ok(());
            }
        };
        for (key, result) in results {
            match result {
                Ok(()) => {
                    EventLogger::log_event(LifecycleEvent::DeviceBlocked { identity: key.to_string() });
                    report.devices_blocked.push(key);
                }
                Err(e) => {
                    error!(identity = %key, error = %e, "Failed to re-block device");
                    report.devices_failed.push(key);
                }
            }
        }
        if report.devices_failed.is_empty() {
            self.log.clear_allowed().await?;
            report.allowed_log_cleared = true;
        }
        Ok(())
    }

    async fn reconnect(&self, names: Vec<String>, report: &mut RestoreReport) -> Result<(), CageError> {
        for name in names {
            info!(interface = %name, "Reconnecting interface");
            match self.network.set_state(&name, LinkState::Up).await {
                Ok(ToggleOutcome::Changed) => {
                    EventLogger::log_event(LifecycleEvent::InterfaceReconnected { interface: name.clone() });
                    report.interfaces_reconnected.push(name);
                }
                Ok(ToggleOutcome::Skipped { reason }) => {
                    info!(interface = %name, reason = %reason, "Nothing to reconnect");
                    report.interfaces_reconnected.push(name);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(interface = %name, error = %e, "Failed to reconnect interface");
                    report.interfaces_failed.push(name);
                }
            }
        }
        if report.interfaces_failed.is_empty() {
            self.log.clear_interfaces().await?;
            report.interfaces_log_cleared = true;
        }
        Ok(())
    }
}
