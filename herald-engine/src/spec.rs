//! Job submission specs and input validation.

use herald_common::address::{is_email_shaped, normalize_recipient};
use herald_common::SenderIdentity;
use herald_smtp::{BodyFormat, SecurityMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SMTP submission settings for one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub security: SecurityMode,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Per-connection I/O timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

const fn default_port() -> u16 {
    25
}

const fn default_timeout_secs() -> f64 {
    30.0
}

/// Everything needed to run one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub campaign_id: String,
    pub smtp: SmtpSettings,
    pub senders: Vec<SenderIdentity>,
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub bodies: Vec<String>,
    #[serde(default)]
    pub format: BodyFormat,
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Substitution pools for `[URL]` and `[SRC]` placeholders.
    #[serde(default)]
    pub url_pool: Vec<String>,
    #[serde(default)]
    pub src_pool: Vec<String>,
    pub recipients: Vec<String>,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_thread_workers")]
    pub thread_workers: usize,
    /// Delay between messages within one worker, seconds.
    #[serde(default)]
    pub delay_s: f64,
    /// Sleep between chunks, seconds.
    #[serde(default)]
    pub sleep_chunks: f64,

    #[serde(default = "default_spam_threshold")]
    pub spam_threshold: f64,
    /// When off, preflight findings never block dispatch.
    #[serde(default = "default_true")]
    pub backoff_enabled: bool,
    /// Override the per-campaign anti-duplication guard.
    #[serde(default)]
    pub force_new_job: bool,
}

const fn default_chunk_size() -> usize {
    100
}

const fn default_thread_workers() -> usize {
    4
}

const fn default_spam_threshold() -> f64 {
    5.0
}

const fn default_true() -> bool {
    true
}

/// Validation failures, surfaced synchronously before any job exists.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("SMTP host is required")]
    MissingSmtpHost,

    #[error("invalid SMTP port")]
    InvalidPort,

    #[error("invalid SMTP timeout")]
    InvalidTimeout,

    #[error("no valid sender email")]
    NoValidSender,

    #[error("no valid recipient after filtering")]
    NoValidRecipients,

    #[error("recipient list exceeds the safety cap ({count} > {cap})")]
    TooManyRecipients { count: usize, cap: usize },
}

/// Outcome of recipient filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedInput {
    /// Email-shaped recipients, deduplicated, first-seen order preserved.
    pub recipients: Vec<String>,
    /// How many submitted entries were dropped.
    pub invalid: usize,
    /// Senders with email-shaped addresses.
    pub senders: Vec<SenderIdentity>,
}

impl JobSpec {
    /// Validate the spec against the safety limits.
    ///
    /// # Errors
    /// The first failed check, human readable.
    pub fn validate(&self, max_rcpt: usize) -> Result<ValidatedInput, ValidationError> {
        if self.smtp.host.trim().is_empty() {
            return Err(ValidationError::MissingSmtpHost);
        }
        if self.smtp.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if !self.smtp.timeout_secs.is_finite() || self.smtp.timeout_secs <= 0.0 {
            return Err(ValidationError::InvalidTimeout);
        }

        let senders: Vec<SenderIdentity> = self
            .senders
            .iter()
            .filter(|sender| is_email_shaped(&sender.email))
            .cloned()
            .collect();
        if senders.is_empty() {
            return Err(ValidationError::NoValidSender);
        }

        let mut seen = ahash::AHashSet::new();
        let mut recipients = Vec::new();
        let mut invalid = 0;
        for raw in &self.recipients {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if !is_email_shaped(raw) {
                invalid += 1;
                continue;
            }
            let normalized = normalize_recipient(raw);
            if seen.insert(normalized.clone()) {
                recipients.push(normalized);
            }
        }

        if recipients.is_empty() {
            return Err(ValidationError::NoValidRecipients);
        }
        if recipients.len() > max_rcpt {
            return Err(ValidationError::TooManyRecipients {
                count: recipients.len(),
                cap: max_rcpt,
            });
        }

        Ok(ValidatedInput {
            recipients,
            invalid,
            senders,
        })
    }

    /// Number of distinct (subject, body) renderings the rotation covers.
    #[must_use]
    pub fn variant_count(&self) -> usize {
        self.subjects.len().max(1) * self.bodies.len().max(1)
    }

    /// Copy of the spec safe for durable snapshots: message bodies and the
    /// recipient list are not persisted after injection.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut spec = self.clone();
        spec.bodies = Vec::new();
        spec.recipients = Vec::new();
        spec.smtp.password = None;
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> JobSpec {
        JobSpec {
            campaign_id: "camp001".to_string(),
            smtp: SmtpSettings {
                host: "mta.example".to_string(),
                port: 25,
                security: SecurityMode::Plain,
                username: None,
                password: None,
                timeout_secs: 30.0,
                accept_invalid_certs: false,
            },
            senders: vec![SenderIdentity::new("News", "news@sender.example")],
            subjects: vec!["Hi".to_string()],
            bodies: vec!["Body".to_string()],
            format: BodyFormat::Plain,
            reply_to: None,
            url_pool: Vec::new(),
            src_pool: Vec::new(),
            recipients: vec![
                "alice@example.com".to_string(),
                "bob@other.example".to_string(),
            ],
            chunk_size: 100,
            thread_workers: 4,
            delay_s: 0.0,
            sleep_chunks: 0.0,
            spam_threshold: 5.0,
            backoff_enabled: true,
            force_new_job: false,
        }
    }

    #[test]
    fn test_valid_spec() {
        let input = base_spec().validate(1000).unwrap();
        assert_eq!(input.recipients.len(), 2);
        assert_eq!(input.invalid, 0);
        assert_eq!(input.senders.len(), 1);
    }

    #[test]
    fn test_missing_host() {
        let mut spec = base_spec();
        spec.smtp.host = "  ".to_string();
        assert_eq!(spec.validate(1000), Err(ValidationError::MissingSmtpHost));
    }

    #[test]
    fn test_invalid_port_and_timeout() {
        let mut spec = base_spec();
        spec.smtp.port = 0;
        assert_eq!(spec.validate(1000), Err(ValidationError::InvalidPort));

        let mut spec = base_spec();
        spec.smtp.timeout_secs = 0.0;
        assert_eq!(spec.validate(1000), Err(ValidationError::InvalidTimeout));
    }

    #[test]
    fn test_sender_filtering() {
        let mut spec = base_spec();
        spec.senders = vec![SenderIdentity::new("", "not-an-address")];
        assert_eq!(spec.validate(1000), Err(ValidationError::NoValidSender));
    }

    #[test]
    fn test_recipient_filtering_and_dedup() {
        let mut spec = base_spec();
        spec.recipients = vec![
            "alice@example.com".to_string(),
            "ALICE@EXAMPLE.COM".to_string(), // same mailbox domain-wise
            "garbage".to_string(),
            "".to_string(),
            "bob@other.example".to_string(),
        ];
        let input = spec.validate(1000).unwrap();
        // Local parts are case-sensitive, so ALICE@ is a distinct mailbox;
        // only the unparseable entry counts as invalid.
        assert_eq!(input.recipients.len(), 3);
        assert_eq!(input.invalid, 1);
    }

    #[test]
    fn test_safety_cap_boundary() {
        let mut spec = base_spec();
        spec.recipients = (0..5).map(|i| format!("user{i}@example.com")).collect();
        assert!(spec.validate(5).is_ok());
        assert_eq!(
            spec.validate(4),
            Err(ValidationError::TooManyRecipients { count: 5, cap: 4 })
        );
    }

    #[test]
    fn test_empty_recipients_rejected() {
        let mut spec = base_spec();
        spec.recipients = Vec::new();
        assert_eq!(spec.validate(1000), Err(ValidationError::NoValidRecipients));
    }

    #[test]
    fn test_redacted_drops_payloads() {
        let redacted = base_spec().redacted();
        assert!(redacted.bodies.is_empty());
        assert!(redacted.recipients.is_empty());
        assert_eq!(redacted.campaign_id, "camp001");
    }
}
