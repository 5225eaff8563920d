//! `usbcage run`: one isolation session, or `--restore`.

use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::info;

use usbcage_config::CageConfig;
use usbcage_core::{CageError, SandboxHandle, SandboxTarget};
use usbcage_lifecycle::{
    listen_for_os_signals, shutdown_channel, LifecycleSettings, Orchestrator, RunReport, RunRequest,
    SessionEnd,
};
use usbcage_recovery::{RecoveryLog, RestoreReport, Restorer};

use crate::terminal_output::{note_error, note_info, note_success, note_warn};
use crate::wiring;

/// Exit status when the session failed but every device was re-blocked.
pub const EXIT_SESSION_FAILED: u8 = 1;
/// Exit status when a device may still be reachable from the host.
pub const EXIT_DEVICE_EXPOSED: u8 = 3;
/// Exit status when restore left something undone.
pub const EXIT_RESTORE_INCOMPLETE: u8 = 4;

/// Build the sandbox target from `--sandbox` values and `--gateway-pair`.
pub fn resolve_target(sandboxes: &[String], gateway_pair: Option<&str>) -> Result<SandboxTarget, CageError> {
    let (workstation, gateway) = match (sandboxes, gateway_pair) {
        ([workstation], None) => return Ok(SandboxTarget::single(SandboxHandle::parse(workstation)?)),
        ([workstation], Some(gateway)) => (workstation.as_str(), gateway),
        ([workstation, gateway], None) => (workstation.as_str(), gateway.as_str()),
        ([_, _], Some(_)) => {
            return Err(CageError::Precondition(
                "give the gateway either as a second --sandbox value or with --gateway-pair, not both".to_string(),
            ))
        }
        _ => {
            return Err(CageError::Precondition(
                "--sandbox takes one identifier, or two for a workstation and gateway pair".to_string(),
            ))
        }
    };

    let workstation = SandboxHandle::parse(workstation)?;
    let gateway = SandboxHandle::parse(gateway)?;
    if workstation == gateway {
        return Err(CageError::Precondition(
            "the workstation and gateway must be different sandboxes".to_string(),
        ));
    }
    Ok(SandboxTarget::paired(workstation, gateway))
}

pub async fn run(config: &CageConfig, target: SandboxTarget, interfaces: Option<Vec<String>>) -> Result<ExitCode> {
    let components = wiring::components(config);
    let log = RecoveryLog::new(&config.state_dir);
    let orchestrator = Orchestrator::new(components, log, LifecycleSettings::from_config(config));

    let (trigger, signal) = shutdown_channel();
    let listener = listen_for_os_signals(trigger);

    info!(sandbox = %target.workstation, gateway = ?target.gateway.as_ref().map(|g| g.to_string()), "Starting isolation run");
    note_info("Waiting for a USB mass-storage device. Press Ctrl-C to stop.");
    let result = orchestrator.run(RunRequest { target, interfaces }, signal).await;
    listener.abort();

    let report = result.context("Isolation run aborted")?;
    Ok(ExitCode::from(summarize_run(&report)))
}

fn summarize_run(report: &RunReport) -> u8 {
    for name in &report.interfaces_disconnected {
        note_info(&format!("Interface {name} is down"));
    }
    for uuid in &report.attached {
        note_info(&format!("Attached host USB device {uuid}"));
    }
    for key in &report.reblocked {
        note_success(&format!("Device {key} blocked on the host again"));
    }
    for key in &report.reblock_failed {
        note_error(&format!("Device {key} could NOT be re-blocked and may be reachable from the host"));
    }

    match &report.end {
        SessionEnd::SandboxStopped => note_info("Sandbox stopped"),
        SessionEnd::Interrupted => note_warn("Run interrupted"),
        SessionEnd::Failed(reason) => note_error(&format!("Session failed: {reason}")),
    }
    if !report.interfaces_disconnected.is_empty() || !report.allowed.is_empty() {
        note_warn("The host stays offline until you run `usbcage run --restore`");
    }

    if report.device_exposed() {
        EXIT_DEVICE_EXPOSED
    } else if matches!(report.end, SessionEnd::Failed(_)) {
        EXIT_SESSION_FAILED
    } else {
        0
    }
}

pub async fn restore(config: &CageConfig) -> Result<ExitCode> {
    let runner = wiring::runner();
    let restorer = Restorer::new(
        RecoveryLog::new(&config.state_dir),
        wiring::network(config, &runner),
        wiring::guard(config, &runner),
    );
    let report = restorer.restore().await.context("Restore aborted; recovery journals left in place")?;
    Ok(ExitCode::from(summarize_restore(&report)))
}

fn summarize_restore(report: &RestoreReport) -> u8 {
    if *report == RestoreReport::default() {
        note_success("Nothing to restore");
        return 0;
    }
    if report.incomplete_state {
        note_warn("Only one recovery journal was found; restored what it recorded");
    }
    for key in &report.devices_blocked {
        note_success(&format!("Device {key} blocked"));
    }
    for key in &report.devices_failed {
        note_error(&format!("Device {key} could not be blocked"));
    }
    if report.guard_skipped {
        note_warn("usbguard is not installed; allowed devices were left as they are");
    }
    for name in &report.interfaces_reconnected {
        note_success(&format!("Interface {name} is up"));
    }
    for name in &report.interfaces_failed {
        note_error(&format!("Interface {name} could not be brought up"));
    }
    if report.reconnect_withheld {
        note_error("Network left down because a device is still allowed; fix usbguard and run restore again");
    }

    if report.is_clean() {
        note_success("Host restored");
        0
    } else {
        note_warn("Restore incomplete; journals kept so it can be run again");
        EXIT_RESTORE_INCOMPLETE
    }
}
