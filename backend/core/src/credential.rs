//! Privilege credential handling.
//!
//! A [`Credential`] is handed from a [`CredentialProvider`](crate::traits::CredentialProvider)
//! straight to the subprocess stdin and dropped. It never reaches a log line.
//! The credential buffer and the stdin payload built from it are zeroed on
//! drop. Copies made by the OS or by the terminal line reader are not.

use std::fmt;

/// A secret read from the user. `Debug` and `Display` are masked and the
/// buffer is overwritten when dropped.
pub struct Credential(Vec<u8>);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into().into_bytes())
    }

    /// Take ownership of a line read from the user, dropping the trailing
    /// line break in place so no second copy of the secret is made.
    pub fn from_line(line: String) -> Self {
        let mut bytes = line.into_bytes();
        while matches!(bytes.last(), Some(b'\n' | b'\r')) {
            bytes.pop();
        }
        Self(bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| b.is_ascii_whitespace())
    }

    /// Bytes written to the privileged tool's stdin, newline-terminated.
    pub fn to_stdin_line(&self) -> Vec<u8> {
        let mut line = Vec::with_capacity(self.0.len() + 1);
        line.extend_from_slice(&self.0);
        line.push(b'\n');
        line
    }

    /// Whether `text` contains the secret verbatim (used by log redaction).
    pub fn appears_in(&self, text: &str) -> bool {
        !self.0.is_empty()
            && text
                .as_bytes()
                .windows(self.0.len())
                .any(|w| w == self.0.as_slice())
    }
}

/// Zero `buf` over its whole capacity, including bytes past `len`.
pub fn wipe(buf: &mut Vec<u8>) {
    let len = buf.len();
    buf.resize(buf.capacity(), 0);
    for byte in buf.iter_mut() {
        // volatile so the wipe isn't optimized out
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    buf.truncate(len);
}

impl Drop for Credential {
    fn drop(&mut self) {
        wipe(&mut self.0);
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}
