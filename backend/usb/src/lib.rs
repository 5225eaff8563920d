//! `usbcage-usb`: what is plugged in, and who may use it.

pub mod catalog;
pub mod guard;
pub mod resolver;

pub use catalog::{parse_verbose_listing, LsusbCatalog};
pub use guard::{parse_device_list, UsbGuardGateway};
pub use resolver::{identity_keys, lookup_guard_identity, resolve, GuardLookup};
