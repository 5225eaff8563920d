//! `usbcage-sandbox`: the virtual machine the device is handed to.

pub mod host;
pub mod vbox;

pub use host::{current_group_names, user_in_group};
pub use vbox::{parse_running_vms, parse_usbhost_list, HostUsbDevice, VBoxConfig, VBoxSandbox};
