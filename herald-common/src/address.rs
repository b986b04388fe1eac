//! Email address helpers and sender identities.

use serde::{Deserialize, Serialize};

use crate::domain::Domain;

/// A sender identity used for the From header and SMTP envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    /// Display name, may be empty.
    #[serde(default)]
    pub name: String,
    /// Envelope / From address.
    pub email: String,
}

impl SenderIdentity {
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Domain part of the sender address.
    #[must_use]
    pub fn domain(&self) -> Option<Domain> {
        Domain::of_email(&self.email)
    }

    /// RFC 5322 name-addr form, or the bare address when no name is set.
    #[must_use]
    pub fn name_addr(&self) -> String {
        if self.name.is_empty() {
            self.email.clone()
        } else {
            format!("\"{}\" <{}>", self.name.replace('"', ""), self.email)
        }
    }
}

/// Loose shape check used when filtering recipient lists and when guessing
/// which token of an accounting row is the recipient. Intentionally does not
/// try to be a full RFC 5321 validator.
#[must_use]
pub fn is_email_shaped(s: &str) -> bool {
    let s = s.trim();
    if s.len() < 3 || s.contains(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.rsplit_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

/// Normalize a recipient address for use as a store key: trimmed, angle
/// brackets stripped, domain part lowercased.
#[must_use]
pub fn normalize_recipient(s: &str) -> String {
    let s = s.trim().trim_start_matches('<').trim_end_matches('>');
    match s.rsplit_once('@') {
        Some((local, domain)) => format!("{local}@{}", domain.to_ascii_lowercase()),
        None => s.to_string(),
    }
}

/// Receiver domain of a recipient address.
#[must_use]
pub fn receiver_domain(address: &str) -> Option<Domain> {
    Domain::of_email(address)
}
