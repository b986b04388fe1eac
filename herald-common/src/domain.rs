//! Domain newtype for type safety
//!
//! Wraps domain strings so receiver domains, sender domains and bare email
//! addresses cannot be confused at call sites. Cheap to clone (`Arc<str>`).

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A lowercased domain name.
///
/// # Examples
///
/// ```
/// use herald_common::Domain;
///
/// let domain = Domain::new("Example.COM");
/// assert_eq!(domain.as_str(), "example.com");
///
/// let domain = Domain::of_email("alice@example.com").unwrap();
/// assert_eq!(domain.as_str(), "example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl Domain {
    /// Create a new `Domain`, lowercasing the input.
    #[must_use]
    pub fn new(s: impl AsRef<str>) -> Self {
        let s = s.as_ref();
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            Self(Arc::from(s.to_ascii_lowercase()))
        } else {
            Self(Arc::from(s))
        }
    }

    /// Extract the domain part of an email address.
    ///
    /// Returns `None` when the address has no `@` or an empty domain part.
    #[must_use]
    pub fn of_email(address: &str) -> Option<Self> {
        let (_, domain) = address.trim().rsplit_once('@')?;
        if domain.is_empty() {
            return None;
        }
        Some(Self::new(domain))
    }

    /// Get the domain as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_lowercases() {
        let domain = Domain::new("MAIL.Example.com");
        assert_eq!(domain.as_str(), "mail.example.com");
    }

    #[test]
    fn test_domain_of_email() {
        assert_eq!(
            Domain::of_email("Alice@Example.COM"),
            Some(Domain::new("example.com"))
        );
        assert_eq!(Domain::of_email("not-an-address"), None);
        assert_eq!(Domain::of_email("trailing@"), None);
    }

    #[test]
    fn test_domain_equality_and_hash() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(Domain::new("example.com"), 1);
        assert_eq!(map.get(&Domain::new("EXAMPLE.com")), Some(&1));
    }

    #[test]
    fn test_domain_display() {
        assert_eq!(format!("{}", Domain::new("example.com")), "example.com");
    }
}
