//! VirtualBox sandbox controller: instance lifecycle and USB passthrough via
//! `VBoxManage`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use usbcage_core::{CageError, CommandRunner, CommandSpec, IdentityKey, SandboxHandle, SandboxRuntime};

use crate::host::user_in_group;

static RUNNING_VM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^"(.*)"\s+\{([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})\}\s*$"#,
    )
    .unwrap()
});

static USBHOST_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(UUID|VendorId|ProductId):\s+(\S+)").unwrap());

/// One `VBoxManage list usbhost` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostUsbDevice {
    pub uuid: String,
    pub vendor_id: String,
    pub product_id: String,
}

/// Configuration for the VirtualBox controller.
#[derive(Debug, Clone)]
pub struct VBoxConfig {
    pub program: String,
    /// `--type` for `startvm` when not forced headless.
    pub start_type: String,
    /// Group required for USB passthrough.
    pub required_group: String,
    pub timeout: Duration,
}

impl Default for VBoxConfig {
    fn default() -> Self {
        Self {
            program: "VBoxManage".to_string(),
            start_type: "gui".to_string(),
            required_group: "vboxusers".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct VBoxSandbox {
    runner: Arc<dyn CommandRunner>,
    config: VBoxConfig,
}

impl VBoxSandbox {
    pub fn new(runner: Arc<dyn CommandRunner>, config: VBoxConfig) -> Self {
        Self { runner, config }
    }

    async fn vboxmanage<I, S>(&self, args: I) -> Result<String, CageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new(&self.config.program, self.config.timeout).args(args);
        let output = self.runner.run(&spec).await?;
        debug!(cmd = %spec.command_line(), status = output.status, "VBoxManage finished");
        Ok(output.into_checked(&self.config.program)?.stdout)
    }

    pub async fn list_usb_hosts(&self) -> Result<Vec<HostUsbDevice>, CageError> {
        let stdout = self.vboxmanage(["list", "usbhost"]).await?;
        Ok(parse_usbhost_list(&stdout))
    }
}

#[async_trait]
impl SandboxRuntime for VBoxSandbox {
    async fn user_has_usb_access(&self) -> Result<bool, CageError> {
        user_in_group(&self.config.required_group)
    }

    async fn enable_usb_controller(&self, handle: &SandboxHandle) -> Result<(), CageError> {
        let id = handle.as_arg();
        self.vboxmanage(["modifyvm", id.as_str(), "--usbxhci", "on"]).await?;
        info!(sandbox = %handle, "USB 3.0 controller enabled");
        Ok(())
    }

    async fn start(&self, handle: &SandboxHandle, headless: bool) -> Result<(), CageError> {
        let id = handle.as_arg();
        let start_type = if headless { "headless" } else { self.config.start_type.as_str() };
        info!(sandbox = %handle, start_type, "Starting sandbox");
        self.vboxmanage(["startvm", id.as_str(), "--type", start_type]).await?;
        Ok(())
    }

    async fn usb_uuids(&self, identity: &IdentityKey) -> Result<Vec<String>, CageError> {
        Ok(self
            .list_usb_hosts()
            .await?
            .into_iter()
            .filter(|d| d.vendor_id == identity.vendor_id() && d.product_id == identity.product_id())
            .map(|d| d.uuid)
            .collect())
    }

    async fn attach_device(&self, handle: &SandboxHandle, device_uuid: &str) -> Result<(), CageError> {
        let id = handle.as_arg();
        match self.vboxmanage(["controlvm", id.as_str(), "usbattach", device_uuid]).await {
            Ok(_) => {
                info!(sandbox = %handle, device_uuid, "USB device attached");
                Ok(())
            }
            Err(e) => {
                warn!(sandbox = %handle, device_uuid, error = %e, "USB attach failed");
                Err(e)
            }
        }
    }

    async fn is_running(&self, handle: &SandboxHandle) -> Result<bool, CageError> {
        let stdout = self.vboxmanage(["list", "runningvms"]).await?;
        Ok(parse_running_vms(&stdout).iter().any(|(name, uuid)| match handle {
            SandboxHandle::ByName(wanted) => name == wanted,
            SandboxHandle::ByUuid(wanted) => uuid.eq_ignore_ascii_case(&wanted.hyphenated().to_string()),
        }))
    }
}

/// `"name" {uuid}` lines from `VBoxManage list runningvms`.
pub fn parse_running_vms(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let caps = RUNNING_VM_RE.captures(line.trim())?;
            Some((caps[1].to_string(), caps[2].to_ascii_lowercase()))
        })
        .collect()
}

/// Group `UUID` / `VendorId` / `ProductId` fields into devices. A new
/// `UUID:` line starts the next device.
pub fn parse_usbhost_list(raw: &str) -> Vec<HostUsbDevice> {
    let mut devices = Vec::new();
    let mut current: Option<(String, Option<String>, Option<String>)> = None;

    let mut flush = |entry: Option<(String, Option<String>, Option<String>)>| {
        if let Some((uuid, Some(vendor_id), Some(product_id))) = entry {
            devices.push(HostUsbDevice { uuid, vendor_id, product_id });
        }
    };

    for line in raw.lines() {
        let Some(caps) = USBHOST_FIELD_RE.captures(line) else {
            continue;
        };
        let value = caps[2].to_string();
        match &caps[1] {
            "UUID" => flush(current.replace((value.to_ascii_lowercase(), None, None))),
            "VendorId" => {
                if let Some(entry) = current.as_mut() {
                    entry.1 = strip_hex_prefix(&value);
                }
            }
            "ProductId" => {
                if let Some(entry) = current.as_mut() {
                    entry.2 = strip_hex_prefix(&value);
                }
            }
            _ => {}
        }
    }
    flush(current.take());
    devices
}

fn strip_hex_prefix(value: &str) -> Option<String> {
    let hex = value.strip_prefix("0x").unwrap_or(value);
    (hex.len() == 4 && hex.chars().all(|c| c.is_ascii_hexdigit())).then(|| hex.to_ascii_lowercase())
}
