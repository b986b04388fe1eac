//! HTTP accounting bridge client (pull mode).
//!
//! The bridge process fronts the MTA's accounting directory and exposes the
//! same cursor semantics as the direct tailer. Responses have drifted across
//! bridge versions, so the client accepts both raw-line arrays and arrays of
//! already-parsed objects, under any of a handful of historical field names.

use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::{AcctError, Result},
    event::{AccountingEvent, OutcomeKind},
    parser::LineParser,
    tailer::PullStats,
};

/// Optional scoping headers for a pull.
#[derive(Debug, Clone, Default)]
pub struct PullScope {
    pub job_id: Option<String>,
    pub campaign_id: Option<String>,
    pub message_id: Option<String>,
}

/// One bridge pull, normalized.
#[derive(Debug, Clone)]
pub struct BridgePull {
    pub events: Vec<AccountingEvent>,
    /// The cursor the server told us to use next. `None` when the server
    /// did not supply one; the caller then keeps its current cursor.
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub stats: PullStats,
}

/// Response array field names seen across bridge versions.
const ITEM_KEYS: &[&str] = &["items", "lines", "outcomes", "results", "events"];

pub struct BridgeClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
    parser: Mutex<LineParser>,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl BridgeClient {
    /// # Errors
    /// Propagates client construction failure.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            http,
            parser: Mutex::new(LineParser::new()),
        })
    }

    /// Apply a single-token outcome override map to raw-line parsing.
    #[must_use]
    pub fn with_type_map(self, type_map: &str) -> Self {
        *self.parser.lock() = LineParser::new().with_type_map(type_map);
        self
    }

    /// Pull the next batch from the bridge.
    ///
    /// The caller must hand back the returned `next_cursor` on its next call
    /// and must not fabricate cursors. Any failure leaves the caller's
    /// cursor untouched by construction: nothing here mutates it.
    ///
    /// # Errors
    /// Network failures, non-success statuses, and unusable payloads.
    pub async fn pull(
        &self,
        kind: &str,
        limit: usize,
        cursor: Option<&str>,
        scope: &PullScope,
    ) -> Result<BridgePull> {
        let url = format!("{}/api/v1/pull/latest", self.base_url);
        let limit = limit.max(1).to_string();
        let mut query: Vec<(&str, &str)> =
            vec![("kind", kind), ("max_lines", &limit), ("all", "0")];
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            query.push(("cursor", cursor));
        }

        let mut request = self.http.get(&url).query(&query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(job_id) = &scope.job_id {
            request = request.header("X-Job-ID", job_id);
        }
        if let Some(campaign_id) = &scope.campaign_id {
            request = request.header("X-Campaign-ID", campaign_id);
        }
        if let Some(message_id) = &scope.message_id {
            request = request.header("Message-ID", message_id);
        }

        let response = request.send().await?;
        let status = response.status();
        let body: Value = if status.is_success() {
            response.json().await?
        } else {
            let text = response.text().await.unwrap_or_default();
            if status.is_client_error() && text.to_ascii_lowercase().contains("cursor") {
                return Err(AcctError::InvalidCursor(format!("{status}: {text}")));
            }
            return Err(AcctError::Bridge(format!("{status}: {text}")));
        };

        if body.get("ok").and_then(Value::as_bool) == Some(false) {
            return Err(AcctError::Bridge(
                body.get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("bridge reported failure")
                    .to_string(),
            ));
        }

        Ok(self.normalize(&body))
    }

    /// Normalize one response body. Detects the item array and the element
    /// kind (raw line vs parsed object) at runtime.
    fn normalize(&self, body: &Value) -> BridgePull {
        let source = body
            .get("file")
            .and_then(Value::as_str)
            .unwrap_or("bridge")
            .to_string();

        let items = ITEM_KEYS
            .iter()
            .filter_map(|key| body.get(*key))
            .find_map(Value::as_array)
            .or_else(|| first_array(body));

        let mut events = Vec::new();
        let mut stats = PullStats::default();
        if let Some(items) = items {
            let mut parser = self.parser.lock();
            for item in items {
                stats.received_lines += 1;
                let event = match item {
                    Value::String(line) => parser.parse_line(&source, line),
                    Value::Object(object) => parser.event_from_object(object),
                    _ => None,
                };
                match event {
                    Some(mut event) => {
                        stats.parsed += 1;
                        stats.unique_lines += 1;
                        if event.kind == OutcomeKind::Unknown {
                            stats.unknown_outcome += 1;
                        }
                        event.source_file = Some(source.clone());
                        events.push(event);
                    }
                    None => stats.skipped += 1,
                }
            }
        } else {
            warn!("bridge response carried no item array");
        }

        // Server-side stats win when present.
        if let Some(server_stats) = body.get("stats").and_then(Value::as_object) {
            let read = |key: &str| {
                server_stats
                    .get(key)
                    .and_then(Value::as_u64)
                    .and_then(|v| usize::try_from(v).ok())
            };
            if let Some(parsed) = read("parsed") {
                stats.parsed = parsed;
            }
            if let Some(skipped) = read("skipped") {
                stats.skipped = skipped;
            }
            if let Some(unknown) = read("unknown_outcome") {
                stats.unknown_outcome = unknown;
            }
        }

        let next_cursor = body
            .get("next_cursor")
            .or_else(|| body.get("cursor"))
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let has_more = body
            .get("has_more")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        debug!(
            events = events.len(),
            has_more, "normalized bridge pull"
        );

        BridgePull {
            events,
            next_cursor,
            has_more,
            stats,
        }
    }
}

/// Depth-first search for the first array in a payload, for bridge versions
/// that nest the items under a wrapper object.
fn first_array(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(array) => Some(array),
        Value::Object(object) => object.values().find_map(first_array),
        _ => None,
    }
}

/// Strip scheme and port from a host so a bridge URL can be derived from a
/// campaign's SMTP host.
#[must_use]
pub fn normalize_bridge_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    let host = host.split('/').next().unwrap_or(host);
    // Keep bracketed IPv6 literals intact; otherwise drop a trailing :port.
    if host.starts_with('[') {
        host.split(']').next().map_or_else(
            || host.to_string(),
            |bracketed| format!("{bracketed}]"),
        )
    } else {
        host.split(':').next().unwrap_or(host).to_string()
    }
}

/// Bridge base URL for a campaign SMTP host and configured bridge port.
#[must_use]
pub fn bridge_url_for_host(host: &str, port: u16) -> String {
    format!("http://{}:{port}", normalize_bridge_host(host))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BridgeClient {
        BridgeClient::new("http://bridge.local:8090", None).unwrap()
    }

    #[test]
    fn test_normalize_raw_lines() {
        let body: Value = serde_json::json!({
            "ok": true,
            "file": "acct-20260101.csv",
            "lines": [
                "type,timeLogged,mailFrom,rcpt,dsnStatus",
                "d,1,a@s.example,alice@example.com,2.0.0",
                "t,2,a@s.example,bob@example.com,4.4.1"
            ],
            "next_cursor": "abc123",
            "has_more": true
        });
        let pull = client().normalize(&body);
        assert_eq!(pull.events.len(), 2);
        assert_eq!(pull.events[0].kind, OutcomeKind::Delivered);
        assert_eq!(pull.events[1].kind, OutcomeKind::Deferred);
        assert_eq!(pull.next_cursor.as_deref(), Some("abc123"));
        assert!(pull.has_more);
    }

    #[test]
    fn test_normalize_object_items_and_server_stats() {
        let body: Value = serde_json::json!({
            "ok": true,
            "items": [
                {"type": "b", "rcpt": "carol@example.com", "dsnStatus": "5.1.1"},
                {"type": "d", "rcpt": "dave@example.com"}
            ],
            "stats": {"parsed": 2, "skipped": 7, "unknown_outcome": 0},
            "next_cursor": "next",
            "has_more": false
        });
        let pull = client().normalize(&body);
        assert_eq!(pull.events.len(), 2);
        assert_eq!(pull.events[0].kind, OutcomeKind::Bounced);
        assert_eq!(pull.stats.skipped, 7);
        assert!(!pull.has_more);
    }

    #[test]
    fn test_normalize_nested_array_fallback() {
        let body: Value = serde_json::json!({
            "ok": true,
            "result": {"wrapped": [
                {"type": "c", "rcpt": "eve@example.com"}
            ]}
        });
        let pull = client().normalize(&body);
        assert_eq!(pull.events.len(), 1);
        assert_eq!(pull.events[0].kind, OutcomeKind::Complained);
        assert_eq!(pull.next_cursor, None);
    }

    #[test]
    fn test_normalize_bridge_host() {
        assert_eq!(
            normalize_bridge_host("http://194.116.172.135:2525"),
            "194.116.172.135"
        );
        assert_eq!(
            normalize_bridge_host("smtp.campaign.local:2525"),
            "smtp.campaign.local"
        );
        assert_eq!(normalize_bridge_host("smtp.campaign.local"), "smtp.campaign.local");
        assert_eq!(
            bridge_url_for_host("https://smtp.campaign.local:2525", 8090),
            "http://smtp.campaign.local:8090"
        );
    }
}
