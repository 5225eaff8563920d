//! Real host-tool components built from the assembled config.

use std::sync::Arc;

use usbcage_config::CageConfig;
use usbcage_core::{CommandRunner, CredentialProvider, SystemCommandRunner};
use usbcage_lifecycle::Components;
use usbcage_network::{IpLinkController, IpLinkTools, TerminalCredentialProvider};
use usbcage_sandbox::{VBoxConfig, VBoxSandbox};
use usbcage_usb::{LsusbCatalog, UsbGuardGateway};

pub fn runner() -> Arc<dyn CommandRunner> {
    Arc::new(SystemCommandRunner)
}

pub fn catalog(config: &CageConfig, runner: &Arc<dyn CommandRunner>) -> Arc<LsusbCatalog> {
    Arc::new(LsusbCatalog::new(runner.clone(), &config.tools.lsusb, config.command_timeout()))
}

pub fn guard(config: &CageConfig, runner: &Arc<dyn CommandRunner>) -> Arc<UsbGuardGateway> {
    Arc::new(UsbGuardGateway::new(runner.clone(), &config.tools.usbguard, config.command_timeout()))
}

pub fn network(config: &CageConfig, runner: &Arc<dyn CommandRunner>) -> Arc<IpLinkController> {
    let credentials: Arc<dyn CredentialProvider> = Arc::new(TerminalCredentialProvider::default());
    let tools = IpLinkTools { ip: config.tools.ip.clone(), sudo: config.tools.sudo.clone() };
    Arc::new(IpLinkController::new(
        runner.clone(),
        credentials,
        tools,
        config.interface_toggle_timeout(),
        config.command_timeout(),
    ))
}

pub fn sandbox(config: &CageConfig, runner: &Arc<dyn CommandRunner>) -> Arc<VBoxSandbox> {
    let vbox = VBoxConfig {
        program: config.tools.vboxmanage.clone(),
        start_type: config.vm_start_type.clone(),
        required_group: config.required_group.clone(),
        timeout: config.command_timeout(),
    };
    Arc::new(VBoxSandbox::new(runner.clone(), vbox))
}

pub fn components(config: &CageConfig) -> Components {
    let runner = runner();
    Components {
        catalog: catalog(config, &runner),
        guard: guard(config, &runner),
        network: network(config, &runner),
        sandbox: sandbox(config, &runner),
    }
}
