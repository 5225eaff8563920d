//! Log Redaction Layer
//!
//! Scrubs sudo prompts and any echoed credential from captured tool output
//! before it reaches a log line.

use once_cell::sync::Lazy;
use regex::Regex;

use usbcage_core::Credential;

static SUDO_PROMPT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[sudo\] password for [^:]*:\s*").unwrap());

/// Redact sudo prompts, and `credential` itself if the tool echoed it.
pub fn redact_command_output(input: &str, credential: Option<&Credential>) -> String {
    let mut redacted = SUDO_PROMPT_RE.replace_all(input, "[sudo prompt] ").to_string();

    if let Some(credential) = credential {
        if credential.appears_in(&redacted) {
            // byte-level match; rebuild line by line without the secret
            redacted = redacted
                .lines()
                .map(|line| {
                    if credential.appears_in(line) {
                        "[REDACTED_CREDENTIAL]"
                    } else {
                        line
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");
        }
    }
    redacted
}
