//! Normalized accounting events and outcome kind derivation.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// The reconciled outcome class carried by one accounting row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Delivered,
    Bounced,
    Deferred,
    Complained,
    Unknown,
}

impl OutcomeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Bounced => "bounced",
            Self::Deferred => "deferred",
            Self::Complained => "complained",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a canonical kind name. Used by the configurable type map.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "delivered" => Some(Self::Delivered),
            "bounced" => Some(Self::Bounced),
            "deferred" => Some(Self::Deferred),
            "complained" => Some(Self::Complained),
            _ => None,
        }
    }
}

/// One accounting row, normalized. The raw string-keyed shape never leaves
/// the parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingEvent {
    pub kind: OutcomeKind,
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn_diag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_logged: Option<String>,
    /// Transport metadata, filled in by the tailer, never serialized.
    #[serde(default, skip_serializing, skip_deserializing)]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing, skip_deserializing)]
    pub offset: Option<u64>,
}

impl Default for OutcomeKind {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Parse a `D:deferred,B:bounced` style override map for single-token codes.
#[must_use]
pub fn parse_type_map(spec: &str) -> AHashMap<String, OutcomeKind> {
    let mut map = AHashMap::new();
    for pair in spec.split(',') {
        let Some((token, name)) = pair.split_once(':') else {
            continue;
        };
        if let Some(kind) = OutcomeKind::from_name(name) {
            map.insert(token.trim().to_ascii_lowercase(), kind);
        }
    }
    map
}

/// Derive an [`OutcomeKind`] from one raw token.
///
/// Handles the single-letter accounting codes, common word forms and SMTP
/// phrases, enhanced status codes, and DSN actions. Unrecognised input maps
/// to [`OutcomeKind::Unknown`].
#[must_use]
pub fn normalize_kind(token: &str, overrides: &AHashMap<String, OutcomeKind>) -> OutcomeKind {
    let token = token.trim().to_ascii_lowercase();
    if token.is_empty() {
        return OutcomeKind::Unknown;
    }

    if let Some(kind) = overrides.get(&token) {
        return *kind;
    }

    match token.as_str() {
        "d" => return OutcomeKind::Delivered,
        "b" => return OutcomeKind::Bounced,
        "t" => return OutcomeKind::Deferred,
        "c" => return OutcomeKind::Complained,
        _ => {}
    }

    // Enhanced status codes (2.x.x / 4.x.x / 5.x.x).
    if token.starts_with("2.") {
        return OutcomeKind::Delivered;
    }
    if token.starts_with("4.") {
        return OutcomeKind::Deferred;
    }
    if token.starts_with("5.") {
        return OutcomeKind::Bounced;
    }

    if contains_any(&token, &["complaint", "complained", "fbl", "abuse"]) {
        return OutcomeKind::Complained;
    }
    if contains_any(
        &token,
        &["delivered", "delivery ok", "relayed", "accepted", "sent ok", "success"],
    ) {
        return OutcomeKind::Delivered;
    }
    if contains_any(
        &token,
        &["deferred", "delayed", "transient", "tempfail", "greylist", "throttl"],
    ) {
        return OutcomeKind::Deferred;
    }
    if contains_any(
        &token,
        &["bounced", "bounce", "rejected", "failed", "failure", "expired", "unknown user", "no such user"],
    ) {
        return OutcomeKind::Bounced;
    }

    OutcomeKind::Unknown
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(token: &str) -> OutcomeKind {
        normalize_kind(token, &AHashMap::new())
    }

    #[test]
    fn test_single_letter_codes() {
        assert_eq!(kind("d"), OutcomeKind::Delivered);
        assert_eq!(kind("B"), OutcomeKind::Bounced);
        assert_eq!(kind("t"), OutcomeKind::Deferred);
        assert_eq!(kind("C"), OutcomeKind::Complained);
    }

    #[test]
    fn test_enhanced_status_prefixes() {
        assert_eq!(kind("2.0.0"), OutcomeKind::Delivered);
        assert_eq!(kind("4.7.1"), OutcomeKind::Deferred);
        assert_eq!(kind("5.1.1"), OutcomeKind::Bounced);
    }

    #[test]
    fn test_word_forms() {
        assert_eq!(kind("relayed"), OutcomeKind::Delivered);
        assert_eq!(kind("message delayed by remote"), OutcomeKind::Deferred);
        assert_eq!(kind("550 no such user here"), OutcomeKind::Bounced);
        assert_eq!(kind("fbl report"), OutcomeKind::Complained);
        assert_eq!(kind("gibberish"), OutcomeKind::Unknown);
        assert_eq!(kind(""), OutcomeKind::Unknown);
    }

    #[test]
    fn test_type_map_override() {
        let overrides = parse_type_map("D:deferred,B:bounced,C:complained,T:deferred");
        assert_eq!(normalize_kind("D", &overrides), OutcomeKind::Deferred);
        assert_eq!(normalize_kind("t", &overrides), OutcomeKind::Deferred);
        // Tokens outside the map still use the built-in rules.
        assert_eq!(normalize_kind("5.1.1", &overrides), OutcomeKind::Bounced);
    }
}
