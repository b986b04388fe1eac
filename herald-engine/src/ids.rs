//! Job ids and correlation message-ids.
//!
//! Every injected message carries a message-id of the form
//! `<opaque.jobid.campaign.cN.wM@host>` so the accounting stream can be
//! correlated back to the originating job, chunk and worker without any
//! server-side state. Job ids are twelve hex characters.

use rand::Rng;

const JOB_ID_LEN: usize = 12;

/// Generate a fresh twelve-hex job id.
#[must_use]
pub fn new_job_id() -> String {
    let mut rng = rand::rng();
    (0..JOB_ID_LEN)
        .map(|_| char::from_digit(rng.random_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// Twelve lowercase hex characters.
#[must_use]
pub fn is_job_id(token: &str) -> bool {
    token.len() == JOB_ID_LEN && token.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Fields recovered from one of our message-ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIdParts {
    pub job_id: String,
    pub campaign_id: Option<String>,
    pub chunk: Option<u32>,
    pub worker: Option<u32>,
}

/// Format the message-id for one injected message.
#[must_use]
pub fn format_message_id(
    opaque: &str,
    job_id: &str,
    campaign_id: &str,
    chunk: u32,
    worker: u32,
    host: &str,
) -> String {
    format!("<{opaque}.{job_id}.{campaign_id}.c{chunk}.w{worker}@{host}>")
}

/// Recover the correlation fields from a message-id.
///
/// Accepts the full five-segment form, the legacy two-segment form
/// (`<opaque.jobid@host>`), and as a last resort scans for any bare
/// twelve-hex token. The scan is best effort only; nothing guarantees such
/// a token is unique to one job.
#[must_use]
pub fn parse_message_id(message_id: &str) -> Option<MessageIdParts> {
    let trimmed = message_id.trim().trim_start_matches('<').trim_end_matches('>');
    let local = trimmed.split('@').next()?;
    let segments: Vec<&str> = local.split('.').collect();

    if segments.len() >= 5 {
        let last = segments.len() - 1;
        let worker = segments[last].strip_prefix('w').and_then(|n| n.parse().ok());
        let chunk = segments[last - 1]
            .strip_prefix('c')
            .and_then(|n| n.parse().ok());
        if let (Some(chunk), Some(worker)) = (chunk, worker) {
            if is_job_id(segments[1]) {
                return Some(MessageIdParts {
                    job_id: segments[1].to_string(),
                    campaign_id: Some(segments[2..last - 1].join(".")),
                    chunk: Some(chunk),
                    worker: Some(worker),
                });
            }
        }
    }

    // Legacy two-segment form.
    if segments.len() == 2 && is_job_id(segments[1]) {
        return Some(MessageIdParts {
            job_id: segments[1].to_string(),
            campaign_id: None,
            chunk: None,
            worker: None,
        });
    }

    // Best-effort: any twelve-hex token anywhere in the id.
    segments
        .iter()
        .find(|segment| is_job_id(segment))
        .map(|segment| MessageIdParts {
            job_id: (*segment).to_string(),
            campaign_id: None,
            chunk: None,
            worker: None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_shape() {
        let id = new_job_id();
        assert!(is_job_id(&id), "{id:?}");
        assert!(!is_job_id("short"));
        assert!(!is_job_id("zzzzzzzzzzzz"));
    }

    #[test]
    fn test_message_id_roundtrip() {
        let message_id =
            format_message_id("u1f3", "abcdef123456", "camp001", 3, 7, "herald.local");
        assert_eq!(message_id, "<u1f3.abcdef123456.camp001.c3.w7@herald.local>");

        let parts = parse_message_id(&message_id).unwrap();
        assert_eq!(parts.job_id, "abcdef123456");
        assert_eq!(parts.campaign_id.as_deref(), Some("camp001"));
        assert_eq!(parts.chunk, Some(3));
        assert_eq!(parts.worker, Some(7));
    }

    #[test]
    fn test_message_id_with_dotted_campaign() {
        let message_id =
            format_message_id("u1", "abcdef123456", "spring.2026", 0, 0, "herald.local");
        let parts = parse_message_id(&message_id).unwrap();
        assert_eq!(parts.campaign_id.as_deref(), Some("spring.2026"));
    }

    #[test]
    fn test_legacy_two_segment_form() {
        let parts = parse_message_id("<u1f3.abcdef123456@mta.local>").unwrap();
        assert_eq!(parts.job_id, "abcdef123456");
        assert_eq!(parts.campaign_id, None);
    }

    #[test]
    fn test_best_effort_hex_scan() {
        let parts = parse_message_id("<weird.stuff.abcdef123456.more@x>").unwrap();
        assert_eq!(parts.job_id, "abcdef123456");

        assert_eq!(parse_message_id("<nothing.here@x>"), None);
    }
}
