//! Tolerant single-line accounting parser.
//!
//! One parser instance is owned by whichever component feeds it (tailer or
//! bridge client); it remembers the learned CSV header per source path so a
//! feed can resume mid-file after the header has been primed.

use ahash::AHashMap;
use herald_common::address::is_email_shaped;

use crate::event::{normalize_kind, parse_type_map, AccountingEvent, OutcomeKind};

/// Header tokens that identify a row as a CSV header.
const HEADER_MARKERS: &[&str] = &["type", "event", "rcpt", "recipient", "msgid", "message-id"];

/// Lookup chains for each normalized field, tried in order against the
/// lowercased keys of a row.
const RECIPIENT_KEYS: &[&str] = &["rcpt", "recipient", "rcptto", "orig-to", "to"];
const JOB_KEYS: &[&str] = &["job_id", "jobid", "x-job-id", "header_x-job-id", "jobname"];
const CAMPAIGN_KEYS: &[&str] = &[
    "campaign_id",
    "campaignid",
    "x-campaign-id",
    "header_x-campaign-id",
];
const MESSAGE_ID_KEYS: &[&str] = &["msgid", "message-id", "message_id", "header_message-id"];
const DSN_ACTION_KEYS: &[&str] = &["dsnaction", "dsn_action", "action"];
const DSN_STATUS_KEYS: &[&str] = &["dsnstatus", "dsn_status"];
const DSN_DIAG_KEYS: &[&str] = &["dsndiag", "dsn_diag", "dsnmtadiag", "diag"];
const TIME_KEYS: &[&str] = &["timelogged", "time_logged", "time", "timestamp", "date"];

/// Sources the outcome kind is derived from, first non-empty wins.
const KIND_KEYS: &[&str] = &[
    "type",
    "event",
    "kind",
    "record",
    "status",
    "result",
    "state",
];

/// Stateful line parser with per-path header memory.
#[derive(Debug, Default)]
pub struct LineParser {
    headers: AHashMap<String, Vec<String>>,
    type_map: AHashMap<String, OutcomeKind>,
}

impl LineParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `D:deferred,...` style override for single-token codes.
    #[must_use]
    pub fn with_type_map(mut self, spec: &str) -> Self {
        self.type_map = parse_type_map(spec);
        self
    }

    /// Whether a CSV header has been learned for `path`.
    #[must_use]
    pub fn has_header(&self, path: &str) -> bool {
        self.headers.contains_key(path)
    }

    /// Forget learned headers (a rotated file starts over).
    pub fn forget(&mut self, path: &str) {
        self.headers.remove(path);
    }

    /// Parse one raw line into a normalized event.
    ///
    /// Returns `None` for empty lines, header rows, and unparseable JSON;
    /// those are skipped, never errors.
    pub fn parse_line(&mut self, path: &str, line: &str) -> Option<AccountingEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line.starts_with('{') && line.ends_with('}') {
            let value: serde_json::Value = serde_json::from_str(line).ok()?;
            let object = value.as_object()?;
            let mut row = AHashMap::with_capacity(object.len());
            for (key, value) in object {
                row.insert(key.to_ascii_lowercase(), json_scalar(value));
            }
            return self.event_from_row(&row, &[]);
        }

        let delimiter = elect_delimiter(line);
        let tokens = tokenize(line, delimiter);
        if tokens.iter().all(|token| token.trim().is_empty()) {
            return None;
        }

        if is_header_row(&tokens) {
            self.headers.insert(
                path.to_string(),
                tokens.iter().map(|t| t.trim().to_ascii_lowercase()).collect(),
            );
            return None;
        }

        let mut row = AHashMap::new();
        if let Some(header) = self.headers.get(path) {
            if header.len() == tokens.len() {
                for (key, token) in header.iter().zip(&tokens) {
                    row.insert(key.clone(), token.trim().to_string());
                }
            }
        }
        if row.is_empty() {
            // Conservative positional mapping for the legacy 9-column layout
            // (type, time, time, mailfrom, rcpt, _, status, dsnStatus, dsnDiag).
            let positional: &[(usize, &str)] = &[
                (0, "type"),
                (1, "timelogged"),
                (3, "mailfrom"),
                (4, "rcpt"),
                (6, "status"),
                (7, "dsnstatus"),
                (8, "dsndiag"),
            ];
            for &(index, key) in positional {
                if let Some(token) = tokens.get(index) {
                    let token = token.trim();
                    if token.is_empty() {
                        continue;
                    }
                    // Short rows shift fields around; only accept a time
                    // that at least starts numerically.
                    if key == "timelogged" && !token.starts_with(|c: char| c.is_ascii_digit()) {
                        continue;
                    }
                    row.insert(key.to_string(), token.to_string());
                }
            }
        }

        self.event_from_row(&row, &tokens)
    }

    /// Normalize an already-parsed string-keyed row (bridge object payloads
    /// land here directly). Keys must already be lowercased.
    #[must_use]
    pub fn event_from_object(&self, object: &serde_json::Map<String, serde_json::Value>) -> Option<AccountingEvent> {
        let mut row = AHashMap::with_capacity(object.len());
        for (key, value) in object {
            row.insert(key.to_ascii_lowercase(), json_scalar(value));
        }
        self.event_from_row(&row, &[])
    }

    fn event_from_row(
        &self,
        row: &AHashMap<String, String>,
        tokens: &[String],
    ) -> Option<AccountingEvent> {
        let lookup = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|key| row.get(*key))
                .map(|value| value.trim())
                .find(|value| !value.is_empty())
                .map(ToString::to_string)
        };

        let dsn_action = lookup(DSN_ACTION_KEYS);
        let dsn_status = lookup(DSN_STATUS_KEYS);
        let dsn_diag = lookup(DSN_DIAG_KEYS);

        let kind_token = lookup(KIND_KEYS)
            .or_else(|| dsn_action.clone())
            .or_else(|| dsn_status.clone())
            .or_else(|| dsn_diag.clone())
            .unwrap_or_default();
        let kind = normalize_kind(&kind_token, &self.type_map);

        let recipient = lookup(RECIPIENT_KEYS)
            .filter(|candidate| is_email_shaped(candidate))
            .or_else(|| fallback_recipient(tokens))?;

        let message_id = lookup(MESSAGE_ID_KEYS)
            .or_else(|| tokens.iter().map(|t| t.trim()).find(|t| t.starts_with('<') && t.ends_with('>')).map(ToString::to_string));

        Some(AccountingEvent {
            kind,
            recipient: recipient.trim_matches(['<', '>']).to_string(),
            job_id: lookup(JOB_KEYS),
            campaign_id: lookup(CAMPAIGN_KEYS),
            message_id,
            dsn_action,
            dsn_status,
            dsn_diag,
            time_logged: lookup(TIME_KEYS),
            source_file: None,
            offset: None,
        })
    }
}

/// Serialize an event back to one NDJSON line. `parse_line` on the output
/// reproduces the event (transport metadata excluded).
#[must_use]
pub fn serialize_event(event: &AccountingEvent) -> String {
    let mut object = serde_json::Map::new();
    object.insert("type".into(), event.kind.as_str().into());
    object.insert("rcpt".into(), event.recipient.as_str().into());
    let optional: &[(&str, &Option<String>)] = &[
        ("job_id", &event.job_id),
        ("campaign_id", &event.campaign_id),
        ("msgid", &event.message_id),
        ("dsnAction", &event.dsn_action),
        ("dsnStatus", &event.dsn_status),
        ("dsnDiag", &event.dsn_diag),
        ("timeLogged", &event.time_logged),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            object.insert((*key).into(), value.as_str().into());
        }
    }
    serde_json::Value::Object(object).to_string()
}

/// When no mapped recipient exists, fall back to the email-shaped tokens of
/// the row: the second one when present (the first is typically mailfrom),
/// otherwise the only one. Angle-bracketed tokens are message-ids, not
/// recipients.
fn fallback_recipient(tokens: &[String]) -> Option<String> {
    let mut shaped = tokens
        .iter()
        .map(|token| token.trim())
        .filter(|token| !token.starts_with('<'))
        .filter(|token| is_email_shaped(token));
    let first = shaped.next()?;
    Some(shaped.next().unwrap_or(first).to_string())
}

fn json_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_header_row(tokens: &[String]) -> bool {
    tokens.iter().any(|token| {
        let token = token.trim().to_ascii_lowercase();
        HEADER_MARKERS.contains(&token.as_str())
    })
}

/// Pick the delimiter by occurrence count: tab beats comma on ties, the
/// semicolon only wins outright.
fn elect_delimiter(line: &str) -> char {
    let commas = line.matches(',').count();
    let tabs = line.matches('\t').count();
    let semicolons = line.matches(';').count();

    if tabs > 0 && tabs >= commas {
        '\t'
    } else if semicolons > commas {
        ';'
    } else {
        ','
    }
}

/// CSV tokenization honoring double-quoted fields with embedded delimiters
/// and doubled-quote escapes.
fn tokenize(line: &str, delimiter: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' {
            in_quotes = true;
        } else if c == delimiter {
            tokens.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    tokens.push(current);
    tokens
}
