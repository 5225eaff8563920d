//! usbguard gateway.
//!
//! Guard IDs are assigned by the usbguard daemon and reshuffle whenever it
//! restarts, so every transition resolves identity keys against a fresh
//! `list-devices` call. Nothing here caches an ID.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use usbcage_core::{
    CageError, CommandRunner, CommandSpec, GuardPolicy, GuardRecord, GuardState, IdentityKey,
};

static DEVICE_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+):\s+(allow|block|reject)\s+id\s+([0-9a-fA-F]{4}:[0-9a-fA-F]{4})\b")
        .unwrap()
});

pub struct UsbGuardGateway {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
}

impl UsbGuardGateway {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>, timeout: Duration) -> Self {
        Self { runner, program: program.into(), timeout }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.program, self.timeout)
    }

    async fn transition(&self, verb: &str, guard_id: &str) -> Result<(), CageError> {
        let spec = self.command().arg(verb).arg(guard_id);
        let output = self.runner.run(&spec).await.map_err(unavailable_if_missing)?;
        output.into_checked(&self.program).map(|_| ())
    }
}

fn unavailable_if_missing(err: CageError) -> CageError {
    if err.is_missing_tool() {
        CageError::GuardUnavailable
    } else {
        err
    }
}

#[async_trait]
impl GuardPolicy for UsbGuardGateway {
    async fn is_installed(&self) -> bool {
        let spec = CommandSpec::new("which", self.timeout).arg(&self.program);
        match self.runner.run(&spec).await {
            Ok(out) => out.success() && !out.stdout.trim().is_empty(),
            Err(e) => {
                debug!(error = %e, "usbguard lookup failed");
                false
            }
        }
    }

    async fn list_devices(&self) -> Result<Vec<GuardRecord>, CageError> {
        let spec = self.command().arg("list-devices");
        let output = self.runner.run(&spec).await.map_err(unavailable_if_missing)?;
        if !output.success() {
            // typically "IPC connection failure" when the daemon is down
            warn!(status = output.status, stderr = %output.stderr.trim(), "usbguard list-devices failed");
            return Err(CageError::GuardUnavailable);
        }
        Ok(parse_device_list(&output.stdout))
    }

    async fn list_blocked(&self) -> Result<Vec<GuardRecord>, CageError> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .filter(|r| r.state == GuardState::Blocked)
            .collect())
    }

    async fn allow(&self, keys: &BTreeSet<IdentityKey>) -> Result<Vec<GuardRecord>, CageError> {
        let blocked = self.list_blocked().await?;
        debug!(blocked = ?blocked.iter().map(|r| &r.guard_id).collect::<Vec<_>>(), "usbguard blocked devices");

        let mut allowed = Vec::new();
        for record in blocked.into_iter().filter(|r| keys.contains(&r.identity)) {
            match self.transition("allow-device", &record.guard_id).await {
                Ok(()) => {
                    info!(guard_id = %record.guard_id, identity = %record.identity, "Allowed device");
                    allowed.push(GuardRecord { state: GuardState::Allowed, ..record });
                }
                // keep going: what already transitioned must reach the caller
                Err(e) => {
                    warn!(guard_id = %record.guard_id, identity = %record.identity, error = %e, "Failed to allow device");
                }
            }
        }
        Ok(allowed)
    }

    async fn block(
        &self,
        keys: &BTreeSet<IdentityKey>,
    ) -> Result<Vec<(IdentityKey, Result<(), CageError>)>, CageError> {
        let inventory = self.list_devices().await?;
        let mut results = Vec::with_capacity(keys.len());

        for key in keys {
            let mut outcome = Ok(());
            let matching: Vec<_> = inventory.iter().filter(|r| &r.identity == key).collect();
            if matching.is_empty() {
                // Unplugged; usbguard applies its implicit policy on re-insert.
                info!(identity = %key, "Device not present; nothing to block");
            }
            for record in matching {
                if record.state == GuardState::Blocked {
                    debug!(guard_id = %record.guard_id, identity = %key, "Already blocked");
                    continue;
                }
                match self.transition("block-device", &record.guard_id).await {
                    Ok(()) => info!(guard_id = %record.guard_id, identity = %key, "Blocked device"),
                    Err(e) => {
                        warn!(guard_id = %record.guard_id, identity = %key, error = %e, "Failed to block device");
                        outcome = Err(e);
                    }
                }
            }
            results.push((key.clone(), outcome));
        }
        Ok(results)
    }
}

/// Parse `usbguard list-devices` output. `reject` is reported as blocked.
pub fn parse_device_list(raw: &str) -> Vec<GuardRecord> {
    raw.lines()
        .filter_map(|line| {
            let Some(caps) = DEVICE_LINE_RE.captures(line) else {
                if !line.trim().is_empty() {
                    debug!(line = %line, "Skipping unrecognised usbguard line");
                }
                return None;
            };
            let identity = caps[3].parse().ok()?;
            let state = match &caps[2] {
                "allow" => GuardState::Allowed,
                _ => GuardState::Blocked,
            };
            Some(GuardRecord { guard_id: caps[1].to_string(), identity, state })
        })
        .collect()
}
