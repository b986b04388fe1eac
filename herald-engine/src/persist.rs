//! Throttled job persistence.
//!
//! Each job accrues state events; a snapshot is written when at least one
//! second has passed since the last write or enough events piled up, or
//! immediately when forced (terminal transitions, operator actions). A
//! failed write aborts that snapshot only: memory stays the source of
//! truth and the next tick retries.

use std::sync::Arc;
use std::time::Instant;

use herald_common::ConfigStore;
use herald_store::{Store, Table};
use tracing::warn;

use crate::{
    job::Job,
    outcome::OutcomeStore,
    registry::RecipientRegistry,
};

pub struct Persister {
    store: Arc<Store>,
    config: Arc<ConfigStore>,
    outcomes: Arc<OutcomeStore>,
    registry: Arc<RecipientRegistry>,
}

impl Persister {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        config: Arc<ConfigStore>,
        outcomes: Arc<OutcomeStore>,
        registry: Arc<RecipientRegistry>,
    ) -> Self {
        Self {
            store,
            config,
            outcomes,
            registry,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Persist the job if the throttle allows (or `force`).
    pub async fn maybe_persist(&self, job: &Arc<Job>, force: bool) {
        let policy = self.config.snapshot();
        let due = job.with_state(|state| {
            if !force {
                let interval_ok = state.last_persist_at.map_or(true, |at| {
                    at.elapsed().as_secs_f64() >= policy.persist_min_interval_secs
                });
                let events_ok = state.pending_events >= policy.persist_event_threshold;
                if !interval_ok && !events_ok {
                    return false;
                }
                if state.pending_events == 0 {
                    return false;
                }
            }
            state.pending_events = 0;
            state.last_persist_at = Some(Instant::now());
            true
        });
        if !due {
            return;
        }

        let snapshot = job.snapshot();
        if let Err(e) = self.store.put(Table::Jobs, &job.id, &snapshot).await {
            warn!(job = %job.id, error = %e, "job snapshot write failed");
            return;
        }

        let outcome_rows = self.outcomes.rows(&job.id);
        if let Err(e) = self.store.put(Table::Outcomes, &job.id, &outcome_rows).await {
            warn!(job = %job.id, error = %e, "outcome rows write failed");
        }
        let registry_rows = self.registry.entries_for_job(&job.id);
        if let Err(e) = self.store.put(Table::Registry, &job.id, &registry_rows).await {
            warn!(job = %job.id, error = %e, "registry rows write failed");
        }
    }

    /// Remove every durable trace of a job.
    pub async fn remove(&self, job_id: &str) {
        for table in [Table::Jobs, Table::Outcomes, Table::Registry] {
            if let Err(e) = self.store.delete(table, job_id).await {
                warn!(job = job_id, error = %e, "durable delete failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ahash::AHashMap;

    use super::*;
    use crate::job::JobSnapshot;
    use crate::outcome::OutcomeStatus;
    use crate::spec::JobSpec;

    fn spec() -> JobSpec {
        serde_json::from_value(serde_json::json!({
            "campaign_id": "camp001",
            "smtp": {"host": "mta.example"},
            "senders": [{"name": "", "email": "news@sender.example"}],
            "bodies": ["hello"],
            "recipients": ["alice@example.com"]
        }))
        .unwrap()
    }

    async fn persister(dir: &std::path::Path) -> Persister {
        Persister::new(
            Arc::new(Store::open(dir).await.unwrap()),
            Arc::new(ConfigStore::new()),
            Arc::new(OutcomeStore::new()),
            Arc::new(RecipientRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_force_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path()).await;

        let job = Arc::new(Job::new("abcdef123456".to_string(), spec()));
        job.with_state(|state| {
            state.counters.sent = 3;
            state.mark_dirty();
        });
        persister.maybe_persist(&job, true).await;

        let loaded: Option<JobSnapshot> = persister
            .store
            .get(Table::Jobs, "abcdef123456")
            .await
            .unwrap();
        assert_eq!(loaded.unwrap().counters.sent, 3);
    }

    #[tokio::test]
    async fn test_throttle_skips_quiet_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path()).await;

        let job = Arc::new(Job::new("abcdef123456".to_string(), spec()));
        // No pending events: nothing written without force.
        persister.maybe_persist(&job, false).await;
        let loaded: Option<JobSnapshot> = persister
            .store
            .get(Table::Jobs, "abcdef123456")
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_persists_outcome_and_registry_rows() {
        let dir = tempfile::tempdir().unwrap();
        let persister = persister(dir.path()).await;

        let job = Arc::new(Job::new("abcdef123456".to_string(), spec()));
        persister
            .outcomes
            .apply("abcdef123456", "alice@example.com", OutcomeStatus::Delivered);
        persister
            .registry
            .record("abcdef123456", "camp001", "alice@example.com");
        job.with_state(crate::job::JobState::mark_dirty);
        persister.maybe_persist(&job, true).await;

        let outcomes: Option<AHashMap<String, OutcomeStatus>> = persister
            .store
            .get(Table::Outcomes, "abcdef123456")
            .await
            .unwrap();
        assert_eq!(
            outcomes.unwrap().get("alice@example.com"),
            Some(&OutcomeStatus::Delivered)
        );

        persister.remove("abcdef123456").await;
        let outcomes: Option<AHashMap<String, OutcomeStatus>> = persister
            .store
            .get(Table::Outcomes, "abcdef123456")
            .await
            .unwrap();
        assert!(outcomes.is_none());
    }
}
