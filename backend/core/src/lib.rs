//! `usbcage-core`: shared vocabulary for the usbcage workspace.
//!
//! Device, guard, and sandbox types, the error taxonomy, the command-runner
//! seam every host tool goes through, and the component traits the
//! lifecycle orchestrator is written against.

pub mod command;
pub mod credential;
pub mod error;
pub mod traits;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner};
pub use credential::Credential;
pub use error::{CageError, CageResult};
pub use traits::{CredentialProvider, DeviceCatalog, GuardPolicy, InterfaceControl, SandboxRuntime};
pub use types::{
    DeviceDescriptor, GuardRecord, GuardState, IdentityKey, LinkState, SandboxHandle,
    SandboxTarget, ToggleOutcome, MASS_STORAGE_CLASS,
};
