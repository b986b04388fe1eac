//! Layered runtime configuration.
//!
//! Every key resolves through three layers: durable operator overrides,
//! process environment (`HERALD_<KEY>`), then the schema default. Reads
//! report which layer supplied the value. Writes are validated against the
//! key's declared type; keys marked `restart_required` are persisted but not
//! re-applied to the running process, everything else is folded into a fresh
//! [`PolicySnapshot`] that consumers pick up on their next iteration.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use thiserror::Error;

/// Value type of a configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Str,
    Int,
    Float,
    Bool,
}

impl ConfigKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

/// Which layer supplied an effective value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    Default,
}

impl ConfigSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Override => "override",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

/// Schema entry for a single key.
#[derive(Debug, Clone, Copy)]
pub struct KeySpec {
    pub name: &'static str,
    pub kind: ConfigKind,
    pub default: &'static str,
    /// Persisted on write, but only picked up on process restart.
    pub restart_required: bool,
}

const fn key(name: &'static str, kind: ConfigKind, default: &'static str) -> KeySpec {
    KeySpec {
        name,
        kind,
        default,
        restart_required: false,
    }
}

const fn key_restart(name: &'static str, kind: ConfigKind, default: &'static str) -> KeySpec {
    KeySpec {
        name,
        kind,
        default,
        restart_required: true,
    }
}

/// The full key schema. Hot keys feed [`PolicySnapshot`].
pub const SCHEMA: &[KeySpec] = &[
    // Paths and sockets are fixed for the process lifetime.
    key_restart("data_dir", ConfigKind::Str, "./herald-data"),
    key_restart("control_socket", ConfigKind::Str, "/tmp/herald.sock"),
    // MTA monitor.
    key("monitor_url", ConfigKind::Str, ""),
    key("monitor_api_key", ConfigKind::Str, ""),
    key("monitor_strict", ConfigKind::Bool, "false"),
    key("monitor_insecure_retry", ConfigKind::Bool, "false"),
    key("monitor_cache_ttl_secs", ConfigKind::Float, "5.0"),
    key("monitor_timeout_secs", ConfigKind::Float, "5.0"),
    // Accounting bridge.
    key("bridge_url", ConfigKind::Str, ""),
    key("bridge_token", ConfigKind::Str, ""),
    key("bridge_port", ConfigKind::Int, "8090"),
    key("bridge_max_lines", ConfigKind::Int, "5000"),
    key("bridge_interval_secs", ConfigKind::Float, "5.0"),
    key("acct_dir", ConfigKind::Str, "/var/log/pmta"),
    key("acct_type_map", ConfigKind::Str, ""),
    // Blacklist survey.
    key("rbl_zones", ConfigKind::Str, "zen.spamhaus.org,bl.spamcop.net"),
    key("dbl_zones", ConfigKind::Str, "dbl.spamhaus.org"),
    key("rbl_bypass", ConfigKind::Bool, "true"),
    // Content scoring.
    key("spamd_addr", ConfigKind::Str, ""),
    key("spam_score_cmd", ConfigKind::Str, ""),
    // Safety limits.
    key("max_rcpt", ConfigKind::Int, "50000"),
    // Scoped backoff.
    key("backoff_base_secs", ConfigKind::Float, "30.0"),
    key("backoff_cap_secs", ConfigKind::Float, "900.0"),
    // Pressure thresholds (monitor side).
    key("queued_l1", ConfigKind::Int, "50000"),
    key("queued_l2", ConfigKind::Int, "120000"),
    key("queued_l3", ConfigKind::Int, "250000"),
    key("spool_l1", ConfigKind::Int, "30000"),
    key("spool_l2", ConfigKind::Int, "80000"),
    key("spool_l3", ConfigKind::Int, "160000"),
    key("deferred_l1", ConfigKind::Int, "200"),
    key("deferred_l2", ConfigKind::Int, "800"),
    key("deferred_l3", ConfigKind::Int, "2000"),
    // Chunk-scoped domain policy.
    key("domain_deferred_block", ConfigKind::Int, "100"),
    key("domain_errors_block", ConfigKind::Int, "50"),
    key("domain_deferred_slow", ConfigKind::Int, "40"),
    key("domain_errors_slow", ConfigKind::Int, "20"),
    // Persistence throttle.
    key("persist_min_interval_secs", ConfigKind::Float, "1.0"),
    key("persist_event_threshold", ConfigKind::Int, "15"),
    // Anti-duplication guard.
    key("campaign_guard_ttl_secs", ConfigKind::Int, "180"),
];

/// Immutable snapshot of the hot-reloadable policy values. Consumers hold an
/// `Arc` and re-fetch at their next loop iteration; writers swap the pointer.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub monitor_url: String,
    pub monitor_api_key: String,
    pub monitor_strict: bool,
    pub monitor_insecure_retry: bool,
    pub monitor_cache_ttl_secs: f64,
    pub monitor_timeout_secs: f64,

    pub bridge_url: String,
    pub bridge_token: String,
    pub bridge_port: u16,
    pub bridge_max_lines: usize,
    pub bridge_interval_secs: f64,
    pub acct_dir: String,
    pub acct_type_map: String,

    pub rbl_zones: Vec<String>,
    pub dbl_zones: Vec<String>,
    pub rbl_bypass: bool,

    pub spamd_addr: String,
    pub spam_score_cmd: String,

    pub max_rcpt: usize,

    pub backoff_base_secs: f64,
    pub backoff_cap_secs: f64,

    pub queued_thresholds: [i64; 3],
    pub spool_thresholds: [i64; 3],
    pub deferred_thresholds: [i64; 3],

    pub domain_deferred_block: i64,
    pub domain_errors_block: i64,
    pub domain_deferred_slow: i64,
    pub domain_errors_slow: i64,

    pub persist_min_interval_secs: f64,
    pub persist_event_threshold: u32,

    pub campaign_guard_ttl_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key} (expected {expected}): {value:?}")]
    InvalidValue {
        key: String,
        expected: &'static str,
        value: String,
    },

    #[error("failed to persist override: {0}")]
    Persist(String),
}

/// Callback used to make override writes durable. Wired to the store by the
/// daemon; tests usually leave it unset.
pub trait OverridePersistence: Send + Sync {
    /// Persist a single override. An empty value removes the override.
    ///
    /// # Errors
    /// Propagated to the writer as [`ConfigError::Persist`].
    fn persist(&self, key: &str, value: &str) -> Result<(), String>;
}

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedWrite {
    /// False when the key is `restart_required`.
    pub hot_reloaded: bool,
}

pub struct ConfigStore {
    overrides: RwLock<AHashMap<String, String>>,
    persistence: Option<Arc<dyn OverridePersistence>>,
    snapshot: RwLock<Arc<PolicySnapshot>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("overrides", &self.overrides.read().len())
            .finish_non_exhaustive()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    #[must_use]
    pub fn new() -> Self {
        let store = Self {
            overrides: RwLock::new(AHashMap::new()),
            persistence: None,
            snapshot: RwLock::new(Arc::new(PolicySnapshot::defaults())),
        };
        store.rebuild_snapshot();
        store
    }

    /// Attach durable persistence and seed the override layer from it.
    #[must_use]
    pub fn with_persistence(
        mut self,
        persistence: Arc<dyn OverridePersistence>,
        seeded: AHashMap<String, String>,
    ) -> Self {
        self.persistence = Some(persistence);
        *self.overrides.write() = seeded;
        self.rebuild_snapshot();
        self
    }

    #[must_use]
    pub fn schema() -> &'static [KeySpec] {
        SCHEMA
    }

    fn spec(name: &str) -> Option<&'static KeySpec> {
        SCHEMA.iter().find(|spec| spec.name == name)
    }

    fn env_var(name: &str) -> String {
        format!("HERALD_{}", name.to_ascii_uppercase())
    }

    /// Effective value and the layer it came from.
    ///
    /// # Errors
    /// [`ConfigError::UnknownKey`] for keys outside the schema.
    pub fn get(&self, name: &str) -> Result<(String, ConfigSource), ConfigError> {
        let spec = Self::spec(name).ok_or_else(|| ConfigError::UnknownKey(name.to_string()))?;

        if let Some(value) = self.overrides.read().get(name) {
            return Ok((value.clone(), ConfigSource::Override));
        }
        if let Ok(value) = std::env::var(Self::env_var(name)) {
            return Ok((value, ConfigSource::Env));
        }
        Ok((spec.default.to_string(), ConfigSource::Default))
    }

    /// Validate and store a new override.
    ///
    /// # Errors
    /// Unknown key, type mismatch, or persistence failure.
    pub fn set(&self, name: &str, value: &str) -> Result<AppliedWrite, ConfigError> {
        let spec = Self::spec(name).ok_or_else(|| ConfigError::UnknownKey(name.to_string()))?;
        Self::validate(spec, value)?;

        if let Some(persistence) = &self.persistence {
            persistence
                .persist(name, value)
                .map_err(ConfigError::Persist)?;
        }
        self.overrides
            .write()
            .insert(name.to_string(), value.to_string());

        if spec.restart_required {
            tracing::info!(key = name, "configuration stored, restart required");
            Ok(AppliedWrite {
                hot_reloaded: false,
            })
        } else {
            self.rebuild_snapshot();
            tracing::info!(key = name, "configuration applied");
            Ok(AppliedWrite { hot_reloaded: true })
        }
    }

    fn validate(spec: &KeySpec, value: &str) -> Result<(), ConfigError> {
        let ok = match spec.kind {
            ConfigKind::Str => true,
            ConfigKind::Int => value.trim().parse::<i64>().is_ok(),
            ConfigKind::Float => value.trim().parse::<f64>().is_ok(),
            ConfigKind::Bool => parse_bool(value).is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(ConfigError::InvalidValue {
                key: spec.name.to_string(),
                expected: spec.kind.as_str(),
                value: value.to_string(),
            })
        }
    }

    /// Current hot policy values. Lock-free for practical purposes: a single
    /// pointer clone under a short read lock.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.read().clone()
    }

    fn rebuild_snapshot(&self) {
        let snapshot = PolicySnapshot::from_lookup(|name| {
            self.get(name).map(|(value, _)| value).unwrap_or_default()
        });
        *self.snapshot.write() = Arc::new(snapshot);
    }

    fn int(&self, name: &str) -> i64 {
        self.get(name)
            .ok()
            .and_then(|(v, _)| v.trim().parse().ok())
            .unwrap_or_default()
    }

    /// Typed convenience accessors used by the daemon at startup.
    #[must_use]
    pub fn get_str(&self, name: &str) -> String {
        self.get(name).map(|(v, _)| v).unwrap_or_default()
    }

    #[must_use]
    pub fn get_usize(&self, name: &str) -> usize {
        usize::try_from(self.int(name)).unwrap_or_default()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

impl PolicySnapshot {
    fn defaults() -> Self {
        Self::from_lookup(|name| {
            Self::default_of(name)
        })
    }

    fn default_of(name: &str) -> String {
        SCHEMA
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.default.to_string())
            .unwrap_or_default()
    }

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn from_lookup(get: impl Fn(&str) -> String) -> Self {
        let int = |name: &str| get(name).trim().parse::<i64>().unwrap_or(0);
        let float = |name: &str| get(name).trim().parse::<f64>().unwrap_or(0.0);
        let boolean = |name: &str| parse_bool(&get(name)).unwrap_or(false);

        Self {
            monitor_url: get("monitor_url"),
            monitor_api_key: get("monitor_api_key"),
            monitor_strict: boolean("monitor_strict"),
            monitor_insecure_retry: boolean("monitor_insecure_retry"),
            monitor_cache_ttl_secs: float("monitor_cache_ttl_secs"),
            monitor_timeout_secs: float("monitor_timeout_secs"),

            bridge_url: get("bridge_url"),
            bridge_token: get("bridge_token"),
            bridge_port: int("bridge_port") as u16,
            bridge_max_lines: int("bridge_max_lines").max(1) as usize,
            bridge_interval_secs: float("bridge_interval_secs"),
            acct_dir: get("acct_dir"),
            acct_type_map: get("acct_type_map"),

            rbl_zones: split_list(&get("rbl_zones")),
            dbl_zones: split_list(&get("dbl_zones")),
            rbl_bypass: boolean("rbl_bypass"),

            spamd_addr: get("spamd_addr"),
            spam_score_cmd: get("spam_score_cmd"),

            max_rcpt: int("max_rcpt").max(1) as usize,

            backoff_base_secs: float("backoff_base_secs"),
            backoff_cap_secs: float("backoff_cap_secs"),

            queued_thresholds: [int("queued_l1"), int("queued_l2"), int("queued_l3")],
            spool_thresholds: [int("spool_l1"), int("spool_l2"), int("spool_l3")],
            deferred_thresholds: [
                int("deferred_l1"),
                int("deferred_l2"),
                int("deferred_l3"),
            ],

            domain_deferred_block: int("domain_deferred_block"),
            domain_errors_block: int("domain_errors_block"),
            domain_deferred_slow: int("domain_deferred_slow"),
            domain_errors_slow: int("domain_errors_slow"),

            persist_min_interval_secs: float("persist_min_interval_secs"),
            persist_event_threshold: int("persist_event_threshold").max(1) as u32,

            campaign_guard_ttl_secs: int("campaign_guard_ttl_secs").max(1) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layer() {
        let store = ConfigStore::new();
        let (value, source) = store.get("bridge_port").unwrap();
        assert_eq!(value, "8090");
        assert_eq!(source, ConfigSource::Default);
    }

    #[test]
    fn test_override_wins_and_hot_reloads() {
        let store = ConfigStore::new();
        let applied = store.set("queued_l1", "60000").unwrap();
        assert!(applied.hot_reloaded);

        let (value, source) = store.get("queued_l1").unwrap();
        assert_eq!(value, "60000");
        assert_eq!(source, ConfigSource::Override);
        assert_eq!(store.snapshot().queued_thresholds[0], 60000);
    }

    #[test]
    fn test_restart_required_not_hot_reloaded() {
        let store = ConfigStore::new();
        let applied = store.set("control_socket", "/run/herald.sock").unwrap();
        assert!(!applied.hot_reloaded);
        // Value is still readable through the layered lookup.
        assert_eq!(store.get_str("control_socket"), "/run/herald.sock");
    }

    #[test]
    fn test_type_validation() {
        let store = ConfigStore::new();
        assert!(matches!(
            store.set("bridge_port", "not-a-number"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            store.set("rbl_bypass", "maybe"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            store.set("no_such_key", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_env_layer() {
        // Key chosen to be unique to this test to avoid cross-test races.
        std::env::set_var("HERALD_DOMAIN_ERRORS_SLOW", "33");
        let store = ConfigStore::new();
        let (value, source) = store.get("domain_errors_slow").unwrap();
        assert_eq!(value, "33");
        assert_eq!(source, ConfigSource::Env);
        std::env::remove_var("HERALD_DOMAIN_ERRORS_SLOW");
    }

    #[test]
    fn test_list_splitting() {
        let store = ConfigStore::new();
        store
            .set("rbl_zones", "zen.spamhaus.org, bl.example.net ,")
            .unwrap();
        assert_eq!(
            store.snapshot().rbl_zones,
            vec!["zen.spamhaus.org".to_string(), "bl.example.net".to_string()]
        );
    }
}
