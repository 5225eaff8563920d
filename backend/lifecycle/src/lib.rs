//! `usbcage-lifecycle`: the device-isolation state machine.
//!
//! [`Orchestrator::run`] walks one session from `Idle` to `Terminal`;
//! [`shutdown`] routes OS interrupts into its polling loops so cleanup
//! always runs.

pub mod orchestrator;
pub mod shutdown;
pub mod state;

pub use orchestrator::{
    Components, LifecycleSettings, Orchestrator, RunReport, RunRequest, SessionEnd,
};
pub use shutdown::{listen_for_os_signals, shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use state::{LifecycleState, StateMachine};
