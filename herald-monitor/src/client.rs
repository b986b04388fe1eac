//! Tolerant MTA monitor HTTP client.
//!
//! Endpoints consumed: `/status`, `/queues`, `/domains`, `/domainDetail`,
//! `/queueDetail`, all with `format=json`. Payload shapes vary between MTA
//! versions, so extraction walks the JSON for the first list-of-objects when
//! looking for queue items, and does a depth-first integer search restricted
//! to recognized key names when looking for totals.

use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use herald_common::Domain;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub cache_ttl: Duration,
    /// When set, monitor unavailability blocks new work instead of being
    /// advisory.
    pub strict: bool,
    /// Retry once with certificate verification disabled after a TLS
    /// failure. An operational affordance for self-signed monitor
    /// deployments, never the default.
    pub allow_insecure_retry: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(5),
            strict: false,
            allow_insecure_retry: false,
        }
    }
}

/// Totals from `/status`. Any field the payload did not carry is `None`;
/// an empty 200 body is a healthy monitor with no counts, not a busy one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MtaStatus {
    pub queued_recipients: Option<i64>,
    pub spool_recipients: Option<i64>,
    pub deferred_total: Option<i64>,
    pub connections: Option<i64>,
}

/// One entry from `/queues`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub name: String,
    pub recipients: i64,
    pub domains: i64,
}

/// One entry from `/domains`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainQueue {
    pub domain: Domain,
    pub queued: i64,
    pub deferred: i64,
    pub active: i64,
}

/// Detail for one domain or queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainDetail {
    pub queued: i64,
    pub deferred: i64,
    pub errors: i64,
}

struct CacheEntry {
    at: Instant,
    value: Arc<Value>,
}

pub struct MonitorClient {
    config: MonitorConfig,
    http: reqwest::Client,
    insecure: OnceLock<reqwest::Client>,
    cache: DashMap<String, CacheEntry>,
}

impl std::fmt::Debug for MonitorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl MonitorClient {
    /// # Errors
    /// Client construction failure.
    pub fn new(config: MonitorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config,
            http,
            insecure: OnceLock::new(),
            cache: DashMap::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.config.base_url.is_empty()
    }

    /// # Errors
    /// Monitor not configured or unreachable.
    pub async fn status(&self) -> Result<MtaStatus> {
        let payload = self.fetch("/status", &[]).await?;
        Ok(MtaStatus {
            queued_recipients: find_int(&payload, &["queuedrcp", "queuedrecipients", "rcp", "recipients"]),
            spool_recipients: find_int(&payload, &["spoolrcp", "spoolrecipients", "spool"]),
            deferred_total: find_int(&payload, &["deferredrcp", "deferred"]),
            connections: find_int(&payload, &["connections", "conn", "smtpout"]),
        })
    }

    /// # Errors
    /// Monitor not configured or unreachable.
    pub async fn queues(&self) -> Result<Vec<QueueEntry>> {
        let payload = self.fetch("/queues", &[]).await?;
        let Some(items) = first_object_list(&payload) else {
            return Ok(Vec::new());
        };
        Ok(items
            .iter()
            .filter_map(|item| {
                let name = find_str(item, &["name", "queue", "domain"])?;
                Some(QueueEntry {
                    name,
                    recipients: find_int(item, &["rcp", "recipients", "queued"]).unwrap_or(0),
                    domains: find_int(item, &["dom", "domains"]).unwrap_or(0),
                })
            })
            .collect())
    }

    /// # Errors
    /// Monitor not configured or unreachable.
    pub async fn domains(&self) -> Result<Vec<DomainQueue>> {
        let payload = self.fetch("/domains", &[]).await?;
        let Some(items) = first_object_list(&payload) else {
            return Ok(Vec::new());
        };
        Ok(items
            .iter()
            .filter_map(|item| {
                let domain = find_str(item, &["domain", "name"])?;
                Some(DomainQueue {
                    domain: Domain::new(domain),
                    queued: find_int(item, &["rcp", "queued", "recipients"]).unwrap_or(0),
                    deferred: find_int(item, &["deferred", "dfr"]).unwrap_or(0),
                    active: find_int(item, &["active", "conn"]).unwrap_or(0),
                })
            })
            .collect())
    }

    /// # Errors
    /// Monitor not configured or unreachable.
    pub async fn domain_detail(&self, domain: &Domain) -> Result<DomainDetail> {
        let payload = self.fetch("/domainDetail", &[("domain", domain.as_str())]).await?;
        Ok(extract_detail(&payload))
    }

    /// # Errors
    /// Monitor not configured or unreachable.
    pub async fn queue_detail(&self, queue: &str) -> Result<DomainDetail> {
        let payload = self.fetch("/queueDetail", &[("queue", queue)]).await?;
        Ok(extract_detail(&payload))
    }

    async fn fetch(&self, path: &str, query: &[(&str, &str)]) -> Result<Arc<Value>> {
        if !self.is_configured() {
            return Err(MonitorError::NotConfigured);
        }

        let cache_key = format!("{path}?{query:?}");
        if let Some(entry) = self.cache.get(&cache_key) {
            if entry.at.elapsed() < self.config.cache_ttl {
                return Ok(entry.value.clone());
            }
        }

        let value = match self.request(&self.http, path, query).await {
            Ok(value) => value,
            Err(first_error) => {
                if self.config.allow_insecure_retry && self.config.base_url.starts_with("https") {
                    warn!(
                        path,
                        error = %first_error,
                        "monitor request failed, retrying without certificate verification"
                    );
                    let insecure = self.insecure_client()?;
                    self.request(insecure, path, query).await?
                } else {
                    return Err(first_error);
                }
            }
        };

        let value = Arc::new(value);
        self.cache.insert(
            cache_key,
            CacheEntry {
                at: Instant::now(),
                value: value.clone(),
            },
        );
        Ok(value)
    }

    async fn request(
        &self,
        client: &reqwest::Client,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value> {
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        let mut request = client.get(&url).query(&[("format", "json")]).query(query);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("X-API-Key", api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::Unavailable(format!("{path}: {status}")));
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            debug!(path, "monitor returned an empty body");
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| MonitorError::Unavailable(format!("{path}: bad payload: {e}")))
    }

    fn insecure_client(&self) -> Result<&reqwest::Client> {
        if let Some(client) = self.insecure.get() {
            return Ok(client);
        }
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(self.insecure.get_or_init(|| client))
    }
}

/// Depth-first search for the first array whose elements are objects.
fn first_object_list(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(array) if array.iter().all(Value::is_object) && !array.is_empty() => {
            Some(array)
        }
        Value::Array(_) => None,
        Value::Object(object) => object.values().find_map(first_object_list),
        _ => None,
    }
}

/// Depth-first integer search restricted to recognized key names. Key
/// comparison is case-insensitive and ignores separators.
fn find_int(value: &Value, names: &[&str]) -> Option<i64> {
    match value {
        Value::Object(object) => {
            for (key, child) in object {
                let folded: String = key
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .to_ascii_lowercase();
                if names.contains(&folded.as_str()) {
                    if let Some(n) = as_int(child) {
                        return Some(n);
                    }
                }
            }
            object.values().find_map(|child| find_int(child, names))
        }
        Value::Array(array) => array.iter().find_map(|child| find_int(child, names)),
        _ => None,
    }
}

fn find_str(value: &Value, names: &[&str]) -> Option<String> {
    let object = value.as_object()?;
    for (key, child) in object {
        if names.iter().any(|name| key.eq_ignore_ascii_case(name)) {
            if let Some(s) = child.as_str() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn extract_detail(payload: &Value) -> DomainDetail {
    DomainDetail {
        queued: find_int(payload, &["rcp", "queued", "recipients"]).unwrap_or(0),
        deferred: find_int(payload, &["deferred", "dfr"]).unwrap_or(0),
        errors: find_int(payload, &["errors", "err", "failures"]).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_find_int_walks_nested_payloads() {
        let payload = json!({
            "data": {"status": {"queue": {"smtp": {"rcp": 120000, "dom": 4}}}}
        });
        assert_eq!(find_int(&payload, &["rcp", "recipients"]), Some(120_000));
        assert_eq!(find_int(&payload, &["missing"]), None);
    }

    #[test]
    fn test_find_int_accepts_string_numbers_and_separators() {
        let payload = json!({"Spool-Rcp": "30500"});
        assert_eq!(find_int(&payload, &["spoolrcp"]), Some(30_500));
    }

    #[test]
    fn test_first_object_list() {
        let payload = json!({
            "data": {
                "note": "x",
                "queues": [{"name": "gmail.com/default", "rcp": 10}]
            }
        });
        let list = first_object_list(&payload).unwrap();
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_empty_body_yields_null_counts() {
        let status = MtaStatus {
            queued_recipients: find_int(&Value::Null, &["rcp"]),
            spool_recipients: None,
            deferred_total: None,
            connections: None,
        };
        assert_eq!(status, MtaStatus::default());
    }

    #[test]
    fn test_extract_detail() {
        let payload = json!({
            "domain": "gmail.com",
            "counts": {"queued": 900, "deferred": 140, "errors": 12}
        });
        let detail = extract_detail(&payload);
        assert_eq!(
            detail,
            DomainDetail {
                queued: 900,
                deferred: 140,
                errors: 12
            }
        );
    }
}
