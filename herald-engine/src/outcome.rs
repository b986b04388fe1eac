//! Per-(job, recipient) outcome rows with monotonic promotion.

use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use herald_accounting::OutcomeKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// The settled (or latest) status for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Deferred,
    Delivered,
    Bounced,
    Complained,
}

impl OutcomeStatus {
    #[must_use]
    pub const fn from_kind(kind: OutcomeKind) -> Option<Self> {
        match kind {
            OutcomeKind::Delivered => Some(Self::Delivered),
            OutcomeKind::Bounced => Some(Self::Bounced),
            OutcomeKind::Deferred => Some(Self::Deferred),
            OutcomeKind::Complained => Some(Self::Complained),
            OutcomeKind::Unknown => None,
        }
    }

    /// Deferred is the only non-final status.
    #[must_use]
    pub const fn is_final(self) -> bool {
        !matches!(self, Self::Deferred)
    }
}

/// What applying one event did to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub previous: Option<OutcomeStatus>,
    /// False when the event was idempotent (same status again) or dominated
    /// (a deferral after a final).
    pub changed: bool,
}

/// Promotion rule: deferred is dominated by any final; finals overwrite each
/// other in arrival order across distinct kinds; repeats are idempotent.
#[must_use]
pub const fn promotes(current: Option<OutcomeStatus>, incoming: OutcomeStatus) -> bool {
    match current {
        None => true,
        Some(current) => {
            if matches!(
                (current, incoming),
                (OutcomeStatus::Deferred, OutcomeStatus::Deferred)
            ) {
                false
            } else if matches!(current, OutcomeStatus::Deferred) {
                true
            } else {
                // Current is final: only a different final replaces it.
                incoming.is_final() && !status_eq(current, incoming)
            }
        }
    }
}

const fn status_eq(a: OutcomeStatus, b: OutcomeStatus) -> bool {
    a as u8 == b as u8
}

/// In-memory outcome rows, sharded per job. Promotion for a given row must
/// happen inside the owning job's critical section; the caller locks the
/// job first, then calls in here.
#[derive(Debug, Default)]
pub struct OutcomeStore {
    jobs: DashMap<String, Arc<Mutex<AHashMap<String, OutcomeStatus>>>>,
}

impl OutcomeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn rows_for(&self, job_id: &str) -> Arc<Mutex<AHashMap<String, OutcomeStatus>>> {
        self.jobs
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AHashMap::new())))
            .clone()
    }

    /// Apply one event under the promotion rule. At most one row exists per
    /// (job, recipient) at all times.
    pub fn apply(&self, job_id: &str, recipient: &str, incoming: OutcomeStatus) -> Applied {
        let rows = self.rows_for(job_id);
        let mut rows = rows.lock();
        let previous = rows.get(recipient).copied();
        if promotes(previous, incoming) {
            rows.insert(recipient.to_string(), incoming);
            Applied {
                previous,
                changed: true,
            }
        } else {
            Applied {
                previous,
                changed: false,
            }
        }
    }

    #[must_use]
    pub fn row(&self, job_id: &str, recipient: &str) -> Option<OutcomeStatus> {
        let rows = self.jobs.get(job_id)?.clone();
        let rows = rows.lock();
        rows.get(recipient).copied()
    }

    /// Distinct recipients currently in each status.
    #[must_use]
    pub fn counts(&self, job_id: &str) -> AHashMap<OutcomeStatus, u64> {
        let mut counts = AHashMap::new();
        if let Some(rows) = self.jobs.get(job_id) {
            let rows = rows.clone();
            let rows = rows.lock();
            for status in rows.values() {
                *counts.entry(*status).or_default() += 1;
            }
        }
        counts
    }

    /// Clone of all rows for one job (persistence).
    #[must_use]
    pub fn rows(&self, job_id: &str) -> AHashMap<String, OutcomeStatus> {
        self.jobs
            .get(job_id)
            .map(|rows| rows.lock().clone())
            .unwrap_or_default()
    }

    /// Seed rows for one job (rehydration).
    pub fn load(&self, job_id: &str, rows: AHashMap<String, OutcomeStatus>) {
        *self.rows_for(job_id).lock() = rows;
    }

    /// Drop every row for one job (job deletion).
    pub fn remove_job(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_then_final_promotes() {
        let store = OutcomeStore::new();
        let first = store.apply("j1", "bob@example.com", OutcomeStatus::Deferred);
        assert!(first.changed);
        assert_eq!(first.previous, None);

        let second = store.apply("j1", "bob@example.com", OutcomeStatus::Delivered);
        assert!(second.changed);
        assert_eq!(second.previous, Some(OutcomeStatus::Deferred));
        assert_eq!(
            store.row("j1", "bob@example.com"),
            Some(OutcomeStatus::Delivered)
        );
    }

    #[test]
    fn test_final_not_demoted_by_deferred() {
        let store = OutcomeStore::new();
        store.apply("j1", "r@example.com", OutcomeStatus::Delivered);
        let applied = store.apply("j1", "r@example.com", OutcomeStatus::Deferred);
        assert!(!applied.changed);
        assert_eq!(
            store.row("j1", "r@example.com"),
            Some(OutcomeStatus::Delivered)
        );
    }

    #[test]
    fn test_finals_overwrite_across_kinds_in_arrival_order() {
        let store = OutcomeStore::new();
        store.apply("j1", "r@example.com", OutcomeStatus::Delivered);
        let applied = store.apply("j1", "r@example.com", OutcomeStatus::Bounced);
        assert!(applied.changed);
        assert_eq!(
            store.row("j1", "r@example.com"),
            Some(OutcomeStatus::Bounced)
        );
    }

    #[test]
    fn test_same_kind_is_idempotent() {
        let store = OutcomeStore::new();
        let first = store.apply("j1", "r@example.com", OutcomeStatus::Bounced);
        let second = store.apply("j1", "r@example.com", OutcomeStatus::Bounced);
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(store.counts("j1").get(&OutcomeStatus::Bounced), Some(&1));
    }

    #[test]
    fn test_counts_track_distinct_recipients() {
        let store = OutcomeStore::new();
        store.apply("j1", "a@example.com", OutcomeStatus::Delivered);
        store.apply("j1", "b@example.com", OutcomeStatus::Delivered);
        store.apply("j1", "b@example.com", OutcomeStatus::Bounced);
        let counts = store.counts("j1");
        assert_eq!(counts.get(&OutcomeStatus::Delivered), Some(&1));
        assert_eq!(counts.get(&OutcomeStatus::Bounced), Some(&1));
    }

    #[test]
    fn test_remove_job_drops_rows() {
        let store = OutcomeStore::new();
        store.apply("j1", "a@example.com", OutcomeStatus::Delivered);
        store.remove_job("j1");
        assert_eq!(store.row("j1", "a@example.com"), None);
    }
}
