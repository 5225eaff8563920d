use thiserror::Error;

/// Top-level error type for usbcage components.
#[derive(Debug, Error)]
pub enum CageError {
    /// Guard missing, privilege group missing, malformed input, dirty state.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("usb guard subsystem is not installed or not reachable")]
    GuardUnavailable,

    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    #[error("privileged credential rejected: {0}")]
    AuthenticationFailure(String),

    #[error("network interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("{program} timed out after {timeout_ms}ms")]
    CommandTimeout { program: String, timeout_ms: u64 },

    #[error("{program} exited with status {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("recovery log error: {0}")]
    RecoveryLog(String),

    #[error("restore incomplete: {0}")]
    RestoreIncomplete(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CageError {
    /// Fatal errors abort the whole run; the rest are logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Precondition(_)
                | Self::GuardUnavailable
                | Self::AuthenticationFailure(_)
                | Self::CommandTimeout { .. }
                | Self::RecoveryLog(_)
        )
    }

    /// True when the tool could not be executed at all.
    pub fn is_missing_tool(&self) -> bool {
        matches!(self, Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type CageResult<T> = Result<T, CageError>;
