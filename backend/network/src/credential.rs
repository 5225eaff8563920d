//! Interactive credential provider.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use nix::sys::termios::{self, LocalFlags, SetArg};
use tracing::debug;

use usbcage_core::{CageError, Credential, CredentialProvider};

/// Prompts on the controlling terminal with echo disabled. Asks every time;
/// nothing is remembered between calls.
#[derive(Debug, Clone)]
pub struct TerminalCredentialProvider {
    prompt: String,
}

impl TerminalCredentialProvider {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into() }
    }
}

impl Default for TerminalCredentialProvider {
    fn default() -> Self {
        Self::new("Enter your sudo password")
    }
}

#[async_trait]
impl CredentialProvider for TerminalCredentialProvider {
    async fn credential(&self, purpose: &str) -> Result<Credential, CageError> {
        let prompt = format!("{} ({purpose}): ", self.prompt);
        tokio::task::spawn_blocking(move || read_hidden_line(&prompt))
            .await
            .map_err(|e| CageError::Other(e.into()))?
    }
}

fn read_hidden_line(prompt: &str) -> Result<Credential, CageError> {
    let stdin = std::io::stdin();
    let mut stderr = std::io::stderr();
    write!(stderr, "{prompt}")?;
    stderr.flush()?;

    // Not a terminal (piped input): read as-is.
    let saved = match termios::tcgetattr(&stdin) {
        Ok(saved) => Some(saved),
        Err(e) => {
            debug!(error = %e, "stdin is not a terminal; echo stays on");
            None
        }
    };
    if let Some(saved) = &saved {
        let mut silent = saved.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        silent.local_flags.insert(LocalFlags::ECHONL);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &silent).map_err(std::io::Error::from)?;
    }

    let mut line = String::with_capacity(256);
    let read = stdin.lock().read_line(&mut line);
    let credential = Credential::from_line(line);

    if let Some(saved) = &saved {
        termios::tcsetattr(&stdin, SetArg::TCSANOW, saved).map_err(std::io::Error::from)?;
    }
    read?;
    Ok(credential)
}
