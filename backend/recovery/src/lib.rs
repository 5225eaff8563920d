//! `usbcage-recovery`: the durable undo log and the restore pass that
//! consumes it, independent of the process that wrote it.

pub mod journal;
pub mod restore;
pub mod store;

pub use journal::{Journal, JOURNAL_FORMAT_VERSION};
pub use restore::{RestoreReport, Restorer};
pub use store::{RecoveryLog, ALLOWED_FILE, INTERFACES_FILE};
