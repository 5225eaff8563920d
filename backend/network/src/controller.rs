//! Privileged link toggling through `sudo -S ip link set`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use usbcage_core::{
    CageError, CommandRunner, CommandSpec, CredentialProvider, InterfaceControl, LinkState,
    ToggleOutcome,
};
use usbcage_logging::redact_command_output;

use crate::discovery::{parse_link_list, LinkInfo};

/// sudo's stderr on a bad, empty, or missing password.
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "incorrect password",
    "Sorry, try again",
    "no password was provided",
    "a password is required",
    "Authentication failure",
];

const MISSING_LINK_MARKERS: &[&str] = &["Cannot find device", "does not exist"];

#[derive(Debug, Clone)]
pub struct IpLinkTools {
    pub ip: String,
    pub sudo: String,
}

impl Default for IpLinkTools {
    fn default() -> Self {
        Self { ip: "ip".to_string(), sudo: "sudo".to_string() }
    }
}

pub struct IpLinkController {
    runner: Arc<dyn CommandRunner>,
    credentials: Arc<dyn CredentialProvider>,
    tools: IpLinkTools,
    /// Privileged toggle timeout; exceeding it is fatal.
    toggle_timeout: Duration,
    query_timeout: Duration,
}

impl IpLinkController {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        credentials: Arc<dyn CredentialProvider>,
        tools: IpLinkTools,
        toggle_timeout: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self { runner, credentials, tools, toggle_timeout, query_timeout }
    }

    async fn link(&self, name: &str) -> Result<LinkInfo, CageError> {
        let spec = CommandSpec::new(&self.tools.ip, self.query_timeout).args(["-o", "link", "show", "dev", name]);
        let output = self.runner.run(&spec).await?;
        if !output.success() && contains_any(&output.stderr, MISSING_LINK_MARKERS) {
            return Err(CageError::InterfaceNotFound(name.to_string()));
        }
        let output = output.into_checked(&self.tools.ip)?;
        parse_link_list(&output.stdout)
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| CageError::InterfaceNotFound(name.to_string()))
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

#[async_trait]
impl InterfaceControl for IpLinkController {
    async fn list_interfaces(&self) -> Result<Vec<String>, CageError> {
        let spec = CommandSpec::new(&self.tools.ip, self.query_timeout).args(["-o", "link", "show"]);
        let output = self.runner.run(&spec).await?.into_checked(&self.tools.ip)?;
        Ok(parse_link_list(&output.stdout).into_iter().map(|l| l.name).collect())
    }

    async fn set_state(&self, name: &str, state: LinkState) -> Result<ToggleOutcome, CageError> {
        let link = match self.link(name).await {
            Ok(link) => link,
            Err(CageError::InterfaceNotFound(_)) => {
                warn!(interface = %name, "Interface not found; skipping");
                return Ok(ToggleOutcome::Skipped { reason: "not found".to_string() });
            }
            Err(e) => return Err(e),
        };
        if link.is_up() == (state == LinkState::Up) {
            info!(interface = %name, state = state.as_arg(), "Interface already in requested state");
            return Ok(ToggleOutcome::Skipped { reason: format!("already {}", state.as_arg()) });
        }

        let credential = self
            .credentials
            .credential(&format!("bring {name} {}", state.as_arg()))
            .await?;
        if credential.is_empty() {
            return Err(CageError::AuthenticationFailure("empty credential".to_string()));
        }

        let spec = CommandSpec::new(&self.tools.sudo, self.toggle_timeout)
            .arg("-S")
            .arg(&self.tools.ip)
            .args(["link", "set", name, state.as_arg()])
            .stdin(credential.to_stdin_line());
        let output = self.runner.run(&spec).await?;
        let stderr = redact_command_output(&output.stderr, Some(&credential));
        drop(credential);
        debug!(interface = %name, status = output.status, stderr = %stderr.trim(), "ip link set finished");

        if output.success() {
            info!(interface = %name, state = state.as_arg(), "Interface toggled");
            return Ok(ToggleOutcome::Changed);
        }
        if contains_any(&output.stderr, AUTH_FAILURE_MARKERS) {
            return Err(CageError::AuthenticationFailure(format!(
                "sudo rejected the credential while toggling {name}"
            )));
        }
        if contains_any(&output.stderr, MISSING_LINK_MARKERS) {
            warn!(interface = %name, "Interface vanished before toggle; skipping");
            return Ok(ToggleOutcome::Skipped { reason: "not found".to_string() });
        }
        Err(CageError::CommandFailed {
            program: self.tools.sudo.clone(),
            status: output.status,
            stderr: stderr.trim().to_string(),
        })
    }
}
