//! External tool invocation.
//!
//! Every host mutation goes through a [`CommandRunner`] so the gateways can be
//! driven by a scripted fake in tests.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::credential::wipe;
use crate::error::CageError;

/// One tool invocation.
#[derive(Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to stdin then closed. Never logged; zeroed on drop.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, payload: Vec<u8>) -> Self {
        self.stdin = Some(payload);
        self
    }

    /// `program arg1 arg2`, used as the fake runner's lookup key.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Drop for CommandSpec {
    fn drop(&mut self) {
        if let Some(payload) = self.stdin.as_mut() {
            wipe(payload);
        }
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("stdin", &self.stdin.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Captured result of a finished tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Convert a non-zero exit into [`CageError::CommandFailed`].
    pub fn into_checked(self, program: &str) -> Result<Self, CageError> {
        if self.success() {
            Ok(self)
        } else {
            Err(CageError::CommandFailed {
                program: program.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is *not* an error here; callers
    /// classify the output themselves.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CageError>;
}

/// Runs tools on the host through `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CageError> {
        debug!(program = %spec.program, args = ?spec.args, "Running host tool");

        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CageError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        if let (Some(payload), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            // a tool that exits without reading stdin is judged by its status
            if let Err(e) = stdin.write_all(payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(CageError::Io(e));
                }
            }
        }

        match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(CageError::Io(e)),
            // kill_on_drop reaps the child once the future is dropped
            Err(_) => Err(CageError::CommandTimeout {
                program: spec.program.clone(),
                timeout_ms: spec.timeout.as_millis() as u64,
            }),
        }
    }
}
