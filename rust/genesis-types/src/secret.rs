//! Opaque wrapper for credential material
//!
//! Tokens, passwords, and keys move through the control plane inside
//! `Secret` so that `Debug`/`Display` output, log lines, and DLQ payloads
//! can never carry the raw value.

use serde::{Deserialize, Serialize};

/// A string secret that redacts itself in all formatted output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value. Call sites are the audit surface.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("****")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_and_display_never_leak() {
        let s = Secret::new("sk-very-private");
        assert_eq!(format!("{:?}", s), "Secret(****)");
        assert_eq!(format!("{}", s), "****");
        assert_eq!(s.expose(), "sk-very-private");
    }
}
