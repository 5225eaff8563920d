//! Structured logging for usbcage.
//!
//! Console and rolling-file subscriber setup, redaction of captured tool
//! output, and the lifecycle event stream.

pub mod event_logger;
pub mod logger;
pub mod redact;

pub use event_logger::{EventLogEntry, EventLogger, LifecycleEvent};
pub use logger::init_logger;
pub use redact::redact_command_output;
