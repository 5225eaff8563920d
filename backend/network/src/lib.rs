//! `usbcage-network`: take the host off the network while a device is
//! being inspected.

pub mod controller;
pub mod credential;
pub mod discovery;

pub use controller::{IpLinkController, IpLinkTools};
pub use credential::TerminalCredentialProvider;
pub use discovery::{parse_link_list, select_targets, LinkInfo, LOOPBACK};
