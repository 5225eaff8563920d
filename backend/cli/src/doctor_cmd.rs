//! CLI Doctor Command
//!
//! Read-only health check: everything `run` needs, without touching host
//! state.

use std::process::ExitCode;

use anyhow::Result;

use usbcage_config::CageConfig;
use usbcage_core::{DeviceCatalog, GuardPolicy, GuardRecord};
use usbcage_recovery::RecoveryLog;
use usbcage_sandbox::user_in_group;
use usbcage_usb::{lookup_guard_identity, resolve};

use crate::terminal_output::{note_check, note_info, note_warn, render_table};
use crate::wiring;

/// Executes the full doctor diagnosis.
pub async fn run(config: &CageConfig) -> Result<ExitCode> {
    println!("\nRunning usbcage doctor...\n");

    let runner = wiring::runner();
    let guard = wiring::guard(config, &runner);
    let catalog = wiring::catalog(config, &runner);

    let guard_ok = guard.is_installed().await;
    note_check(guard_ok, &format!("{} is installed", config.tools.usbguard));

    let group_ok = match user_in_group(&config.required_group) {
        Ok(member) => member,
        Err(e) => {
            note_warn(&format!("Could not read group membership: {e}"));
            false
        }
    };
    note_check(group_ok, &format!("Current user is in the `{}` group", config.required_group));

    let log = RecoveryLog::new(&config.state_dir);
    let clean = !log.is_dirty();
    note_check(
        clean,
        &format!("No leftover recovery journals in {}", log.state_dir().display()),
    );
    if !clean {
        note_info("Run `usbcage run --restore` to undo the previous session");
    }

    check_devices(catalog.as_ref(), guard.as_ref(), guard_ok).await;

    println!();
    if guard_ok && group_ok && clean {
        note_check(true, "Ready to run");
        Ok(ExitCode::SUCCESS)
    } else {
        note_check(false, "Some checks failed; fix the errors above");
        Ok(ExitCode::FAILURE)
    }
}

async fn check_devices(catalog: &dyn DeviceCatalog, guard: &dyn GuardPolicy, guard_ok: bool) {
    let devices = match catalog.list_devices().await {
        Ok(all) => resolve(&all),
        Err(e) => {
            note_warn(&format!("Could not list USB devices: {e}"));
            return;
        }
    };
    if devices.is_empty() {
        note_info("No USB mass-storage device attached");
        return;
    }

    let inventory: Vec<GuardRecord> = if guard_ok {
        guard.list_devices().await.unwrap_or_else(|e| {
            note_warn(&format!("Could not read the usbguard inventory: {e}"));
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let rows: Vec<Vec<String>> = lookup_guard_identity(&devices, &inventory)
        .into_iter()
        .map(|lookup| {
            let state = inventory
                .iter()
                .find(|r| Some(&r.guard_id) == lookup.guard_id.as_ref())
                .map(|r| format!("{:?}", r.state).to_lowercase())
                .unwrap_or_else(|| "-".to_string());
            vec![
                lookup.device.identity().to_string(),
                lookup.device.serial_number.clone(),
                lookup.guard_id.unwrap_or_else(|| "-".to_string()),
                state,
            ]
        })
        .collect();
    println!("\nAttached mass-storage devices:");
    print!("{}", render_table(&["IDENTITY", "SERIAL", "GUARD ID", "STATE"], &rows));
}
