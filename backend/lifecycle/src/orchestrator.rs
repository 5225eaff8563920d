//! Lifecycle Orchestrator
//!
//! Drives one isolation session: wait for a mass-storage device, take the
//! host off the network, release the device through the guard, hand it to
//! the sandbox, and re-block it when the sandbox goes away.
//!
//! Every host mutation is journaled before the next dependent step runs.
//! Once the guard has allowed anything, the cleanup region runs on every
//! exit path, including interrupts and sandbox failures.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{debug, error, info, warn};

use usbcage_config::CageConfig;
use usbcage_core::{
    CageError, DeviceCatalog, DeviceDescriptor, GuardPolicy, GuardRecord, IdentityKey,
    InterfaceControl, LinkState, SandboxHandle, SandboxRuntime, SandboxTarget, ToggleOutcome,
};
use usbcage_logging::{EventLogger, LifecycleEvent};
use usbcage_network::select_targets;
use usbcage_recovery::RecoveryLog;
use usbcage_usb::{identity_keys, lookup_guard_identity, resolve};

use crate::shutdown::ShutdownSignal;
use crate::state::{LifecycleState, StateMachine};

/// The host-facing collaborators, one per external system.
#[derive(Clone)]
pub struct Components {
    pub catalog: Arc<dyn DeviceCatalog>,
    pub guard: Arc<dyn GuardPolicy>,
    pub network: Arc<dyn InterfaceControl>,
    pub sandbox: Arc<dyn SandboxRuntime>,
}

/// Timing and policy knobs, lifted out of [`CageConfig`].
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub device_poll_interval: Duration,
    pub monitor_poll_interval: Duration,
    /// Consecutive catalog or running-check failures tolerated before the
    /// run gives up.
    pub max_consecutive_failures: u32,
    pub excluded_interface_prefixes: Vec<String>,
    /// Shown in the remediation message when group membership is missing.
    pub required_group: String,
    /// Guard inventory polls while waiting for the daemon to see a device.
    pub guard_lookup_attempts: u32,
    pub reblock_attempts: u32,
}

impl LifecycleSettings {
    pub fn from_config(config: &CageConfig) -> Self {
        Self {
            device_poll_interval: config.device_poll_interval(),
            monitor_poll_interval: config.monitor_poll_interval(),
            max_consecutive_failures: config.max_enumeration_failures,
            excluded_interface_prefixes: config.excluded_interface_prefixes.clone(),
            required_group: config.required_group.clone(),
            guard_lookup_attempts: 5,
            reblock_attempts: 3,
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&CageConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub target: SandboxTarget,
    /// Explicit links to isolate; `None` auto-discovers.
    pub interfaces: Option<Vec<String>>,
}

/// How the session part of a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    SandboxStopped,
    Interrupted,
    Failed(String),
}

/// Everything one run did to the host.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub devices: Vec<DeviceDescriptor>,
    pub interfaces_disconnected: Vec<String>,
    pub allowed: Vec<GuardRecord>,
    /// Host USB UUIDs handed to the workstation.
    pub attached: Vec<String>,
    pub reblocked: Vec<IdentityKey>,
    pub reblock_failed: Vec<IdentityKey>,
    pub end: SessionEnd,
    pub history: Vec<LifecycleState>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            devices: Vec::new(),
            interfaces_disconnected: Vec::new(),
            allowed: Vec::new(),
            attached: Vec::new(),
            reblocked: Vec::new(),
            reblock_failed: Vec::new(),
            end: SessionEnd::SandboxStopped,
            history: Vec::new(),
        }
    }

    /// Any allowed device left host-accessible.
    pub fn device_exposed(&self) -> bool {
        !self.reblock_failed.is_empty()
    }
}

pub struct Orchestrator {
    components: Components,
    log: RecoveryLog,
    settings: LifecycleSettings,
    machine: StateMachine,
}

impl Orchestrator {
    pub fn new(components: Components, log: RecoveryLog, settings: LifecycleSettings) -> Self {
        Self { components, log, settings, machine: StateMachine::default() }
    }

    /// Run one session to `Terminal`.
    ///
    /// Errors are returned only when the run stops before anything was
    /// allowed (failed preconditions, a rejected credential). Failures after
    /// that point go through cleanup and are reported in
    /// [`RunReport::end`].
    pub async fn run(
        mut self,
        request: RunRequest,
        mut shutdown: ShutdownSignal,
    ) -> Result<RunReport, CageError> {
        let mut report = RunReport::new();

        self.check_preconditions().await?;

        self.enter(LifecycleState::AwaitingDevice)?;
        let Some(devices) = self.await_devices(&mut shutdown).await? else {
            return self.finish_early(report, SessionEnd::Interrupted);
        };
        report.devices = devices;

        self.enter(LifecycleState::Isolating)?;
        report.interfaces_disconnected = self.isolate(request.interfaces.as_deref()).await?;
        if shutdown.is_triggered() {
            return self.finish_early(report, SessionEnd::Interrupted);
        }

        self.enter(LifecycleState::GuardTransition)?;
        let Some(visible) = self.await_guard_visibility(&report.devices, &mut shutdown).await? else {
            return self.finish_early(report, SessionEnd::Interrupted);
        };
        if visible.is_empty() {
            let reason = "usbguard never listed the inserted device(s)".to_string();
            error!(reason = %reason, "Cannot hand devices to the sandbox");
            return self.finish_early(report, SessionEnd::Failed(reason));
        }
        let wanted = identity_keys(&visible);
        report.allowed = self.components.guard.allow(&wanted).await?;

        // From here on the cleanup region is mandatory.
        let allowed_keys: BTreeSet<IdentityKey> =
            report.allowed.iter().map(|r| r.identity.clone()).collect();
        report.end = match self.journal_allowed(&report.allowed).await {
            Ok(()) => {
                self.session(&request.target, &allowed_keys, &mut report.attached, &mut shutdown)
                    .await
            }
            Err(e) => {
                error!(error = %e, "Could not journal allowed devices; ending session");
                SessionEnd::Failed(e.to_string())
            }
        };

        self.enter(LifecycleState::Cleanup)?;
        let (reblocked, failed) = self.reblock(allowed_keys).await;
        report.reblocked = reblocked;
        report.reblock_failed = failed;
        EventLogger::log_event(LifecycleEvent::CleanupCompleted {
            reblocked: report.reblocked.len(),
            failed: report.reblock_failed.len(),
        });

        self.enter(LifecycleState::Terminal)?;
        report.history = self.machine.history().to_vec();
        info!(
            end = ?report.end,
            interfaces = report.interfaces_disconnected.len(),
            reblocked = report.reblocked.len(),
            "Session finished; network stays down until `usbcage run --restore`"
        );
        Ok(report)
    }

    fn enter(&mut self, state: LifecycleState) -> Result<(), CageError> {
        self.machine.advance(state)?;
        info!(state = %state, "Entering state");
        EventLogger::log_event(LifecycleEvent::StateEntered { state: state.to_string() });
        Ok(())
    }

    fn finish_early(mut self, mut report: RunReport, end: SessionEnd) -> Result<RunReport, CageError> {
        info!(end = ?end, "Run ended before any device was allowed");
        self.enter(LifecycleState::Terminal)?;
        report.end = end;
        report.history = self.machine.history().to_vec();
        Ok(report)
    }

    // ── Idle ────────────────────────────────────────────────────────────

    async fn check_preconditions(&self) -> Result<(), CageError> {
        if !self.components.guard.is_installed().await {
            return Err(CageError::GuardUnavailable);
        }
        if !self.components.sandbox.user_has_usb_access().await? {
            return Err(CageError::Precondition(format!(
                "the current user is not in the `{group}` group; run `sudo usermod -a -G {group} $USER` and log in again",
                group = self.settings.required_group,
            )));
        }
        if self.log.is_dirty() {
            return Err(CageError::Precondition(format!(
                "recovery journals from an unfinished run exist in {}; run `usbcage run --restore` first",
                self.log.state_dir().display()
            )));
        }
        Ok(())
    }

    // ── AwaitingDevice ──────────────────────────────────────────────────

    /// Poll until a mass-storage device shows up. `None` on interrupt.
    async fn await_devices(
        &self,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Option<Vec<DeviceDescriptor>>, CageError> {
        let mut failures = 0u32;
        loop {
            match self.components.catalog.list_devices().await {
                Ok(catalog) => {
                    failures = 0;
                    let devices = resolve(&catalog);
                    if !devices.is_empty() {
                        for device in &devices {
                            info!(
                                identity = %device.identity(),
                                serial = %device.serial_number,
                                "Mass-storage device found"
                            );
                        }
                        return Ok(Some(devices));
                    }
                    debug!("No mass-storage device yet");
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "Device enumeration failed");
                    if failures >= self.settings.max_consecutive_failures {
                        return Err(e);
                    }
                }
            }

            tokio::select! {
                _ = time::sleep(self.settings.device_poll_interval) => {}
                _ = shutdown.wait() => {
                    info!("Interrupted while waiting for a device");
                    return Ok(None);
                }
            }
        }
    }

    // ── Isolating ───────────────────────────────────────────────────────

    /// Bring the target links down, journaling each change before the next.
    async fn isolate(&self, explicit: Option<&[String]>) -> Result<Vec<String>, CageError> {
        let discovered = match explicit {
            Some(_) => Vec::new(),
            None => self.components.network.list_interfaces().await?,
        };
        let targets = select_targets(&discovered, explicit, &self.settings.excluded_interface_prefixes);
        info!(targets = ?targets, "Isolating host network");

        let mut disconnected = Vec::new();
        for name in targets {
            match self.components.network.set_state(&name, LinkState::Down).await {
                Ok(ToggleOutcome::Changed) => {
                    self.log.record_interface_down(&name).await?;
                    EventLogger::log_event(LifecycleEvent::InterfaceDisconnected {
                        interface: name.clone(),
                    });
                    disconnected.push(name);
                }
                Ok(ToggleOutcome::Skipped { reason }) => {
                    info!(interface = %name, reason = %reason, "Interface left as is");
                }
                Err(e) if e.is_fatal() => {
                    error!(interface = %name, error = %e, "Aborting isolation");
                    return Err(e);
                }
                Err(e) => {
                    warn!(interface = %name, error = %e, "Could not bring interface down; continuing");
                }
            }
        }
        Ok(disconnected)
    }

    // ── GuardTransition ─────────────────────────────────────────────────

    /// Wait until the guard daemon lists at least one of `devices`, giving
    /// stragglers a few polls to appear. `None` on interrupt.
    async fn await_guard_visibility(
        &self,
        devices: &[DeviceDescriptor],
        shutdown: &mut ShutdownSignal,
    ) -> Result<Option<Vec<DeviceDescriptor>>, CageError> {
        let attempts = self.settings.guard_lookup_attempts.max(1);
        let mut visible = Vec::new();
        for attempt in 1..=attempts {
            let inventory = self.components.guard.list_devices().await?;
            let lookups = lookup_guard_identity(devices, &inventory);
            visible = lookups
                .iter()
                .filter(|l| l.guard_id.is_some())
                .map(|l| l.device.clone())
                .collect();
            if visible.len() == devices.len() {
                break;
            }
            for missing in lookups.iter().filter(|l| l.guard_id.is_none()) {
                debug!(identity = %missing.device.identity(), attempt, "Device not yet known to usbguard");
            }
            if attempt == attempts {
                break;
            }
            tokio::select! {
                _ = time::sleep(self.settings.device_poll_interval) => {}
                _ = shutdown.wait() => return Ok(None),
            }
        }
        if visible.len() < devices.len() {
            warn!(
                visible = visible.len(),
                resolved = devices.len(),
                "Some devices never appeared in the usbguard inventory; continuing without them"
            );
        }
        Ok(Some(visible))
    }

    async fn journal_allowed(&self, allowed: &[GuardRecord]) -> Result<(), CageError> {
        let mut seen = BTreeSet::new();
        for record in allowed {
            if seen.insert(record.identity.clone()) {
                self.log.record_device_allowed(&record.identity).await?;
            }
            EventLogger::log_event(LifecycleEvent::DeviceAllowed {
                identity: record.identity.to_string(),
                guard_id: record.guard_id.clone(),
            });
        }
        Ok(())
    }

    // ── SandboxStarting / Attaching / Monitoring ────────────────────────

    async fn session(
        &mut self,
        target: &SandboxTarget,
        identities: &BTreeSet<IdentityKey>,
        attached: &mut Vec<String>,
        shutdown: &mut ShutdownSignal,
    ) -> SessionEnd {
        if let Err(e) = self.enter(LifecycleState::SandboxStarting) {
            return SessionEnd::Failed(e.to_string());
        }
        if let Some(gateway) = &target.gateway {
            if let Err(e) = self.bring_up(gateway, true, false).await {
                return SessionEnd::Failed(format!("gateway {gateway}: {e}"));
            }
        }
        if let Err(e) = self.bring_up(&target.workstation, false, true).await {
            return SessionEnd::Failed(format!("workstation {}: {e}", target.workstation));
        }
        if shutdown.is_triggered() {
            return SessionEnd::Interrupted;
        }

        if let Err(e) = self.enter(LifecycleState::Attaching) {
            return SessionEnd::Failed(e.to_string());
        }
        attached.extend(self.attach_all(&target.workstation, identities).await);
        if shutdown.is_triggered() {
            return SessionEnd::Interrupted;
        }

        if let Err(e) = self.enter(LifecycleState::Monitoring) {
            return SessionEnd::Failed(e.to_string());
        }
        self.monitor(&target.workstation, shutdown).await
    }

    /// Start `handle` unless it already runs. The USB controller can only be
    /// switched on while the VM is powered off; failing to do so is logged.
    async fn bring_up(&self, handle: &SandboxHandle, headless: bool, usb: bool) -> Result<(), CageError> {
        let sandbox = &self.components.sandbox;
        if sandbox.is_running(handle).await? {
            info!(sandbox = %handle, "Sandbox already running");
            return Ok(());
        }
        if usb {
            if let Err(e) = sandbox.enable_usb_controller(handle).await {
                warn!(sandbox = %handle, error = %e, "Could not enable the USB controller");
            }
        }
        info!(sandbox = %handle, headless, "Starting sandbox");
        sandbox.start(handle, headless).await
    }

    async fn attach_all(&self, handle: &SandboxHandle, identities: &BTreeSet<IdentityKey>) -> Vec<String> {
        let sandbox = &self.components.sandbox;
        let mut attached = Vec::new();
        for identity in identities {
            let uuids = match sandbox.usb_uuids(identity).await {
                Ok(uuids) if uuids.is_empty() => {
                    warn!(identity = %identity, "VirtualBox does not list the device");
                    continue;
                }
                Ok(uuids) => uuids,
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Could not look up host USB UUIDs");
                    continue;
                }
            };
            for uuid in uuids {
                match sandbox.attach_device(handle, &uuid).await {
                    Ok(()) => {
                        EventLogger::log_event(LifecycleEvent::DeviceAttached {
                            sandbox: handle.to_string(),
                            device_uuid: uuid.clone(),
                        });
                        attached.push(uuid);
                    }
                    Err(e) => {
                        warn!(sandbox = %handle, device_uuid = %uuid, error = %e, "Attach failed; continuing");
                    }
                }
            }
        }
        attached
    }

    async fn monitor(&self, handle: &SandboxHandle, shutdown: &mut ShutdownSignal) -> SessionEnd {
        let mut ticker = time::interval(self.settings.monitor_poll_interval);
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.components.sandbox.is_running(handle).await {
                        Ok(true) => failures = 0,
                        Ok(false) => {
                            info!(sandbox = %handle, "Sandbox stopped");
                            return SessionEnd::SandboxStopped;
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(sandbox = %handle, error = %e, failures, "Running check failed");
                            if failures >= self.settings.max_consecutive_failures {
                                return SessionEnd::Failed(e.to_string());
                            }
                        }
                    }
                }
                _ = shutdown.wait() => {
                    info!(sandbox = %handle, "Interrupted while monitoring");
                    return SessionEnd::Interrupted;
                }
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────────

    /// Block every key that was allowed. Not interruptible.
    async fn reblock(&self, keys: BTreeSet<IdentityKey>) -> (Vec<IdentityKey>, Vec<IdentityKey>) {
        let mut remaining = keys;
        let mut reblocked = Vec::new();
        let attempts = self.settings.reblock_attempts.max(1);

        for attempt in 1..=attempts {
            if remaining.is_empty() {
                break;
            }
            if attempt > 1 {
                time::sleep(self.settings.monitor_poll_interval).await;
            }
            match self.components.guard.block(&remaining).await {
                Ok(results) => {
                    for (key, result) in results {
                        match result {
                            Ok(()) => {
                                EventLogger::log_event(LifecycleEvent::DeviceBlocked {
                                    identity: key.to_string(),
                                });
                                remaining.remove(&key);
                                reblocked.push(key);
                            }
                            Err(e) => warn!(identity = %key, error = %e, attempt, "Re-block failed"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, attempt, "Could not query usbguard for re-block"),
            }
        }

        let failed: Vec<IdentityKey> = remaining.into_iter().collect();
        for key in &failed {
            error!(
                identity = %key,
                "Device is still allowed on the host; run `usbcage run --restore` once usbguard is reachable"
            );
        }
        (reblocked, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use usbcage_core::{GuardState, MASS_STORAGE_CLASS};

    use crate::shutdown::{shutdown_channel, ShutdownTrigger};

    fn device(index: usize, vendor: &str, product: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            local_index: index,
            vendor_id: vendor.into(),
            product_id: product.into(),
            serial_number: format!("SN{index}"),
            interface_classes: [MASS_STORAGE_CLASS.to_string()].into_iter().collect(),
        }
    }

    fn key(raw: &str) -> IdentityKey {
        raw.parse().unwrap()
    }

    struct FakeCatalog {
        responses: Mutex<VecDeque<Result<Vec<DeviceDescriptor>, CageError>>>,
        fallback: Vec<DeviceDescriptor>,
    }

    impl FakeCatalog {
        fn with(devices: Vec<DeviceDescriptor>) -> Self {
            Self { responses: Mutex::new(VecDeque::new()), fallback: devices }
        }
    }

    #[async_trait]
    impl DeviceCatalog for FakeCatalog {
        async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, CageError> {
            match self.responses.lock().unwrap().pop_front() {
                Some(response) => response,
                None => Ok(self.fallback.clone()),
            }
        }
    }

    /// In-memory guard. `refuse` keys fail to allow; `stuck` keys fail to block.
    struct FakeGuard {
        installed: bool,
        states: Mutex<HashMap<IdentityKey, GuardState>>,
        refuse: BTreeSet<IdentityKey>,
        stuck: BTreeSet<IdentityKey>,
        /// Interface journal contents observed when `allow` ran.
        journal_at_allow: Mutex<Option<Vec<String>>>,
        log: Option<RecoveryLog>,
        /// Puts a directory where the allowed journal goes, so the next append fails.
        block_allowed_journal: bool,
    }

    impl FakeGuard {
        fn blocked(keys: &[&str]) -> Self {
            Self {
                installed: true,
                states: Mutex::new(keys.iter().map(|k| (key(k), GuardState::Blocked)).collect()),
                refuse: BTreeSet::new(),
                stuck: BTreeSet::new(),
                journal_at_allow: Mutex::new(None),
                log: None,
                block_allowed_journal: false,
            }
        }

        fn state(&self, raw: &str) -> Option<GuardState> {
            self.states.lock().unwrap().get(&key(raw)).copied()
        }
    }

    #[async_trait]
    impl GuardPolicy for FakeGuard {
        async fn is_installed(&self) -> bool {
            self.installed
        }

        async fn list_devices(&self) -> Result<Vec<GuardRecord>, CageError> {
            let states = self.states.lock().unwrap();
            let mut records: Vec<GuardRecord> = states
                .iter()
                .map(|(identity, state)| GuardRecord {
                    guard_id: identity.product_id().trim_start_matches('0').to_string(),
                    identity: identity.clone(),
                    state: *state,
                })
                .collect();
            records.sort_by(|a, b| a.identity.cmp(&b.identity));
            Ok(records)
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
            if let Some(log) = &self.log {
                let journaled = log.interfaces().await.unwrap();
                *self.journal_at_allow.lock().unwrap() = journaled;
                if self.block_allowed_journal {
                    std::fs::create_dir_all(log.allowed_path()).unwrap();
                }
            }
            let mut allowed = Vec::new();
            for record in self.list_blocked().await? {
                if keys.contains(&record.identity) && !self.refuse.contains(&record.identity) {
                    self.states.lock().unwrap().insert(record.identity.clone(), GuardState::Allowed);
                    allowed.push(GuardRecord { state: GuardState::Allowed, ..record });
                }
            }
            Ok(allowed)
        }

        async fn block(
            &self,
            keys: &BTreeSet<IdentityKey>,
        ) -> Result<Vec<(IdentityKey, Result<(), CageError>)>, CageError> {
            let mut states = self.states.lock().unwrap();
            Ok(keys
                .iter()
                .map(|k| {
                    if self.stuck.contains(k) {
                        (k.clone(), Err(CageError::Other(anyhow::anyhow!("block-device failed"))))
                    } else {
                        states.insert(k.clone(), GuardState::Blocked);
                        (k.clone(), Ok(()))
                    }
                })
                .collect())
        }
    }

    struct FakeNetwork {
        links: Vec<String>,
        down: Mutex<Vec<String>>,
        fail_auth: bool,
    }

    impl FakeNetwork {
        fn with(links: &[&str]) -> Self {
            Self { links: links.iter().map(|s| s.to_string()).collect(), down: Mutex::new(Vec::new()), fail_auth: false }
        }
    }

    #[async_trait]
    impl InterfaceControl for FakeNetwork {
        async fn list_interfaces(&self) -> Result<Vec<String>, CageError> {
            Ok(self.links.clone())
        }

        async fn set_state(&self, name: &str, state: LinkState) -> Result<ToggleOutcome, CageError> {
            if self.fail_auth {
                return Err(CageError::AuthenticationFailure("sudo rejected the password".into()));
            }
            if !self.links.iter().any(|l| l == name) {
                return Ok(ToggleOutcome::Skipped { reason: "no such link".into() });
            }
            if state == LinkState::Down {
                self.down.lock().unwrap().push(name.to_string());
            }
            Ok(ToggleOutcome::Changed)
        }
    }

    /// Runs for `running_polls` checks after start. If `interrupt` is set,
    /// fires it on the first running check instead of stopping. Handles in
    /// `fail_start` refuse to start; `unreachable` makes every running check
    /// after start fail.
    struct FakeSandbox {
        usb_access: bool,
        fail_start: BTreeSet<String>,
        unreachable: bool,
        running_polls: Mutex<u32>,
        started: Mutex<Vec<(String, bool)>>,
        attached: Mutex<Vec<String>>,
        interrupt: Mutex<Option<ShutdownTrigger>>,
    }

    impl FakeSandbox {
        fn new(running_polls: u32) -> Self {
            Self {
                usb_access: true,
                fail_start: BTreeSet::new(),
                unreachable: false,
                running_polls: Mutex::new(running_polls),
                started: Mutex::new(Vec::new()),
                attached: Mutex::new(Vec::new()),
                interrupt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SandboxRuntime for FakeSandbox {
        async fn user_has_usb_access(&self) -> Result<bool, CageError> {
            Ok(self.usb_access)
        }

        async fn enable_usb_controller(&self, _handle: &SandboxHandle) -> Result<(), CageError> {
            Ok(())
        }

        async fn start(&self, handle: &SandboxHandle, headless: bool) -> Result<(), CageError> {
            if self.fail_start.contains(&handle.to_string()) {
                return Err(CageError::CommandFailed {
                    program: "VBoxManage".into(),
                    status: 1,
                    stderr: "VBOX_E_INVALID_OBJECT_STATE".into(),
                });
            }
            self.started.lock().unwrap().push((handle.to_string(), headless));
            Ok(())
        }

        async fn usb_uuids(&self, identity: &IdentityKey) -> Result<Vec<String>, CageError> {
            Ok(vec![format!("uuid-{identity}")])
        }

        async fn attach_device(&self, _handle: &SandboxHandle, device_uuid: &str) -> Result<(), CageError> {
            self.attached.lock().unwrap().push(device_uuid.to_string());
            Ok(())
        }

        async fn is_running(&self, handle: &SandboxHandle) -> Result<bool, CageError> {
            let started = self.started.lock().unwrap().iter().any(|(h, _)| *h == handle.to_string());
            if !started {
                return Ok(false);
            }
            if self.unreachable {
                return Err(CageError::CommandFailed {
                    program: "VBoxManage".into(),
                    status: 1,
                    stderr: "VBoxSVC not responding".into(),
                });
            }
            if let Some(trigger) = self.interrupt.lock().unwrap().take() {
                trigger.trigger();
                return Ok(true);
            }
            let mut polls = self.running_polls.lock().unwrap();
            if *polls == 0 {
                return Ok(false);
            }
            *polls -= 1;
            Ok(true)
        }
    }

    fn fast_settings() -> LifecycleSettings {
        LifecycleSettings {
            device_poll_interval: Duration::from_millis(1),
            monitor_poll_interval: Duration::from_millis(1),
            guard_lookup_attempts: 2,
            ..LifecycleSettings::default()
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            target: SandboxTarget::single(SandboxHandle::parse("analysis-vm").unwrap()),
            interfaces: None,
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        guard: Arc<FakeGuard>,
        network: Arc<FakeNetwork>,
        sandbox: Arc<FakeSandbox>,
        catalog: Arc<FakeCatalog>,
    }

    impl Harness {
        fn new(guard: FakeGuard, network: FakeNetwork, sandbox: FakeSandbox, catalog: FakeCatalog) -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                guard: Arc::new(guard),
                network: Arc::new(network),
                sandbox: Arc::new(sandbox),
                catalog: Arc::new(catalog),
            }
        }

        fn log(&self) -> RecoveryLog {
            RecoveryLog::new(self.dir.path())
        }

        fn orchestrator(&self) -> Orchestrator {
            let components = Components {
                catalog: self.catalog.clone(),
                guard: self.guard.clone(),
                network: self.network.clone(),
                sandbox: self.sandbox.clone(),
            };
            Orchestrator::new(components, self.log(), fast_settings())
        }
    }

    #[tokio::test]
    async fn full_session_journals_and_reblocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = FakeGuard::blocked(&["8087:0026"]);
        guard.log = Some(RecoveryLog::new(dir.path()));
        let mut h = Harness::new(
            guard,
            FakeNetwork::with(&["lo", "eth0", "docker0", "wlan0"]),
            FakeSandbox::new(2),
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );
        h.dir = dir;

        let (_trigger, signal) = shutdown_channel();
        let report = h.orchestrator().run(request(), signal).await.unwrap();

        assert_eq!(report.end, SessionEnd::SandboxStopped);
        assert_eq!(report.interfaces_disconnected, vec!["eth0", "wlan0"]);
        assert_eq!(*h.network.down.lock().unwrap(), vec!["eth0", "wlan0"]);
        // every downed link was journaled before the guard transition
        assert_eq!(
            *h.guard.journal_at_allow.lock().unwrap(),
            Some(vec!["eth0".to_string(), "wlan0".to_string()])
        );
        assert_eq!(report.attached, vec!["uuid-8087:0026"]);
        assert_eq!(report.reblocked, vec![key("8087:0026")]);
        assert!(!report.device_exposed());
        assert_eq!(h.guard.state("8087:0026"), Some(GuardState::Blocked));
        assert_eq!(h.log().allowed_devices().await.unwrap(), Some(vec![key("8087:0026")]));
        assert_eq!(
            report.history,
            vec![
                LifecycleState::Idle,
                LifecycleState::AwaitingDevice,
                LifecycleState::Isolating,
                LifecycleState::GuardTransition,
                LifecycleState::SandboxStarting,
                LifecycleState::Attaching,
                LifecycleState::Monitoring,
                LifecycleState::Cleanup,
                LifecycleState::Terminal,
            ]
        );
    }

    #[tokio::test]
    async fn partial_allow_journals_and_reblocks_only_successes() {
        let mut guard = FakeGuard::blocked(&["0781:5581", "0951:1666", "8087:0026"]);
        guard.refuse.insert(key("0951:1666"));
        let h = Harness::new(
            guard,
            FakeNetwork::with(&["eth0"]),
            FakeSandbox::new(0),
            FakeCatalog::with(vec![
                device(1, "0781", "5581"),
                device(2, "0951", "1666"),
                device(3, "8087", "0026"),
            ]),
        );

        let (_trigger, signal) = shutdown_channel();
        let report = h.orchestrator().run(request(), signal).await.unwrap();

        let expected = vec![key("0781:5581"), key("8087:0026")];
        assert_eq!(h.log().allowed_devices().await.unwrap(), Some(expected.clone()));
        assert_eq!(report.reblocked, expected);
        assert_eq!(h.guard.state("0951:1666"), Some(GuardState::Blocked));
        // only devices the guard actually allowed are handed to the sandbox
        assert_eq!(
            *h.sandbox.attached.lock().unwrap(),
            vec!["uuid-0781:5581".to_string(), "uuid-8087:0026".to_string()]
        );
    }

    #[tokio::test]
    async fn interrupt_during_monitoring_still_reblocks() {
        let h = Harness::new(
            FakeGuard::blocked(&["8087:0026"]),
            FakeNetwork::with(&["eth0"]),
            FakeSandbox::new(u32::MAX),
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );
        let (trigger, signal) = shutdown_channel();
        *h.sandbox.interrupt.lock().unwrap() = Some(trigger);

        let report = h.orchestrator().run(request(), signal).await.unwrap();

        assert_eq!(report.end, SessionEnd::Interrupted);
        assert_eq!(report.reblocked, vec![key("8087:0026")]);
        assert_eq!(h.guard.state("8087:0026"), Some(GuardState::Blocked));
        assert!(report.history.contains(&LifecycleState::Monitoring));
        assert_eq!(report.history.last(), Some(&LifecycleState::Terminal));
    }

    #[tokio::test]
    async fn interrupt_while_waiting_mutates_nothing() {
        let h = Harness::new(
            FakeGuard::blocked(&[]),
            FakeNetwork::with(&["eth0"]),
            FakeSandbox::new(0),
            FakeCatalog::with(Vec::new()),
        );
        let (trigger, signal) = shutdown_channel();
        let orchestrator = h.orchestrator();
        let run = tokio::spawn(orchestrator.run(request(), signal));
        time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.end, SessionEnd::Interrupted);
        assert!(h.network.down.lock().unwrap().is_empty());
        assert!(!h.log().is_dirty());
        assert_eq!(
            report.history,
            vec![LifecycleState::Idle, LifecycleState::AwaitingDevice, LifecycleState::Terminal]
        );
    }

    #[tokio::test]
    async fn dirty_state_refuses_to_run() {
        let h = Harness::new(
            FakeGuard::blocked(&["8087:0026"]),
            FakeNetwork::with(&["eth0"]),
            FakeSandbox::new(0),
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );
        h.log().record_interface_down("eth0").await.unwrap();

        let (_trigger, signal) = shutdown_channel();
        let err = h.orchestrator().run(request(), signal).await.unwrap_err();
        assert!(matches!(err, CageError::Precondition(ref m) if m.contains("--restore")));
        assert!(h.network.down.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_guard_is_fatal_before_any_mutation() {
        let mut guard = FakeGuard::blocked(&["8087:0026"]);
        guard.installed = false;
        let h = Harness::new(
            guard,
            FakeNetwork::with(&["eth0"]),
            FakeSandbox::new(0),
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );

        let (_trigger, signal) = shutdown_channel();
        let err = h.orchestrator().run(request(), signal).await.unwrap_err();
        assert!(matches!(err, CageError::GuardUnavailable));
        assert!(!h.log().is_dirty());
    }

    #[tokio::test]
    async fn missing_group_names_the_remediation() {
        let mut sandbox = FakeSandbox::new(0);
        sandbox.usb_access = false;
        let h = Harness::new(
            FakeGuard::blocked(&[]),
            FakeNetwork::with(&["eth0"]),
            sandbox,
            FakeCatalog::with(Vec::new()),
        );

        let (_trigger, signal) = shutdown_channel();
        let err = h.orchestrator().run(request(), signal).await.unwrap_err();
        assert!(matches!(err, CageError::Precondition(ref m) if m.contains("usermod -a -G vboxusers")));
    }

    #[tokio::test]
    async fn rejected_credential_aborts_before_guard_transition() {
        let mut network = FakeNetwork::with(&["eth0"]);
        network.fail_auth = true;
        let h = Harness::new(
            FakeGuard::blocked(&["8087:0026"]),
            network,
            FakeSandbox::new(0),
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );

        let (_trigger, signal) = shutdown_channel();
        let err = h.orchestrator().run(request(), signal).await.unwrap_err();
        assert!(matches!(err, CageError::AuthenticationFailure(_)));
        assert_eq!(h.guard.state("8087:0026"), Some(GuardState::Blocked));
    }

    #[tokio::test]
    async fn enumeration_failures_are_retried_then_fatal() {
        let catalog = FakeCatalog::with(vec![device(1, "8087", "0026")]);
        catalog
            .responses
            .lock()
            .unwrap()
            .push_back(Err(CageError::Enumeration("lsusb: garbled".into())));
        let h = Harness::new(FakeGuard::blocked(&["8087:0026"]), FakeNetwork::with(&["eth0"]), FakeSandbox::new(0), catalog);
        let (_trigger, signal) = shutdown_channel();
        let report = h.orchestrator().run(request(), signal).await.unwrap();
        assert_eq!(report.devices.len(), 1);

        let catalog = FakeCatalog::with(Vec::new());
        for _ in 0..3 {
            catalog
                .responses
                .lock()
                .unwrap()
                .push_back(Err(CageError::Enumeration("lsusb: garbled".into())));
        }
        let h = Harness::new(FakeGuard::blocked(&[]), FakeNetwork::with(&["eth0"]), FakeSandbox::new(0), catalog);
        let (_trigger, signal) = shutdown_channel();
        let err = h.orchestrator().run(request(), signal).await.unwrap_err();
        assert!(matches!(err, CageError::Enumeration(_)));
    }

    #[tokio::test]
    async fn paired_mode_starts_gateway_headless_first() {
        let h = Harness::new(
            FakeGuard::blocked(&["8087:0026"]),
            FakeNetwork::with(&["eth0"]),
            FakeSandbox::new(0),
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );
        let request = RunRequest {
            target: SandboxTarget::paired(
                SandboxHandle::parse("workstation").unwrap(),
                SandboxHandle::parse("gateway").unwrap(),
            ),
            interfaces: Some(vec!["eth0".into()]),
        };

        let (_trigger, signal) = shutdown_channel();
        h.orchestrator().run(request, signal).await.unwrap();
        assert_eq!(
            *h.sandbox.started.lock().unwrap(),
            vec![("gateway".to_string(), true), ("workstation".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn stuck_block_is_reported_as_exposed() {
        let mut guard = FakeGuard::blocked(&["8087:0026"]);
        guard.stuck.insert(key("8087:0026"));
        let h = Harness::new(
            guard,
            FakeNetwork::with(&["eth0"]),
            FakeSandbox::new(0),
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );

        let (_trigger, signal) = shutdown_channel();
        let report = h.orchestrator().run(request(), signal).await.unwrap();
        assert!(report.device_exposed());
        assert_eq!(report.reblock_failed, vec![key("8087:0026")]);
        assert!(h.log().allowed_path().exists());
    }

    fn assert_failed_then_reblocked(h: &Harness, report: &RunReport) {
        assert!(matches!(report.end, SessionEnd::Failed(_)), "{:?}", report.end);
        assert!(report.history.contains(&LifecycleState::Cleanup));
        assert_eq!(report.history.last(), Some(&LifecycleState::Terminal));
        assert_eq!(report.reblocked, vec![key("8087:0026")]);
        assert!(!report.device_exposed());
        assert_eq!(h.guard.state("8087:0026"), Some(GuardState::Blocked));
    }

    #[tokio::test]
    async fn workstation_start_failure_still_reblocks() {
        let mut sandbox = FakeSandbox::new(0);
        sandbox.fail_start.insert("analysis-vm".into());
        let h = Harness::new(
            FakeGuard::blocked(&["8087:0026"]),
            FakeNetwork::with(&["eth0"]),
            sandbox,
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );

        let (_trigger, signal) = shutdown_channel();
        let report = h.orchestrator().run(request(), signal).await.unwrap();

        assert_failed_then_reblocked(&h, &report);
        assert!(matches!(report.end, SessionEnd::Failed(ref m) if m.starts_with("workstation analysis-vm")));
        assert!(!report.history.contains(&LifecycleState::Attaching));
        assert!(h.sandbox.attached.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn gateway_start_failure_skips_workstation_and_reblocks() {
        let mut sandbox = FakeSandbox::new(0);
        sandbox.fail_start.insert("gateway".into());
        let h = Harness::new(
            FakeGuard::blocked(&["8087:0026"]),
            FakeNetwork::with(&["eth0"]),
            sandbox,
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );
        let request = RunRequest {
            target: SandboxTarget::paired(
                SandboxHandle::parse("workstation").unwrap(),
                SandboxHandle::parse("gateway").unwrap(),
            ),
            interfaces: None,
        };

        let (_trigger, signal) = shutdown_channel();
        let report = h.orchestrator().run(request, signal).await.unwrap();

        assert_failed_then_reblocked(&h, &report);
        assert!(matches!(report.end, SessionEnd::Failed(ref m) if m.starts_with("gateway gateway")));
        assert!(h.sandbox.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unwritable_allowed_journal_ends_session_and_reblocks() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = FakeGuard::blocked(&["8087:0026"]);
        guard.log = Some(RecoveryLog::new(dir.path()));
        guard.block_allowed_journal = true;
        let mut h = Harness::new(
            guard,
            FakeNetwork::with(&["eth0"]),
            FakeSandbox::new(0),
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );
        h.dir = dir;

        let (_trigger, signal) = shutdown_channel();
        let report = h.orchestrator().run(request(), signal).await.unwrap();

        assert_failed_then_reblocked(&h, &report);
        assert!(!report.history.contains(&LifecycleState::SandboxStarting));
        assert!(h.sandbox.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_sandbox_while_monitoring_ends_session_and_reblocks() {
        let mut sandbox = FakeSandbox::new(u32::MAX);
        sandbox.unreachable = true;
        let h = Harness::new(
            FakeGuard::blocked(&["8087:0026"]),
            FakeNetwork::with(&["eth0"]),
            sandbox,
            FakeCatalog::with(vec![device(1, "8087", "0026")]),
        );

        let (_trigger, signal) = shutdown_channel();
        let report = h.orchestrator().run(request(), signal).await.unwrap();

        assert_failed_then_reblocked(&h, &report);
        assert!(report.history.contains(&LifecycleState::Monitoring));
        assert_eq!(report.attached, vec!["uuid-8087:0026"]);
    }
}
