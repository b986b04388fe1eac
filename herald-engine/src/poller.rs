//! The accounting poll loop.
//!
//! One poller owns one feed (HTTP bridge or direct file tailer) and its
//! cursor. Ticks never overlap: the loop is sequential, a new pull starts
//! only after the previous one (and its reconciliation) finished. Failures
//! leave the cursor untouched and retry after the base interval.

use std::sync::Arc;
use std::time::Duration;

use herald_accounting::{AccountingEvent, BridgeClient, PullScope, Tailer};
use herald_common::{ConfigStore, Signal};
use herald_store::{Store, Table};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{persist::Persister, reconcile::Reconciler};

/// Where the events come from.
pub enum FeedSource {
    Bridge(BridgeClient),
    Direct(Tailer),
}

impl FeedSource {
    /// Pull one batch. Returns `(events, next_cursor, has_more)`.
    async fn pull(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> herald_accounting::Result<(Vec<AccountingEvent>, Option<String>, bool)> {
        match self {
            Self::Bridge(bridge) => {
                let pull = bridge
                    .pull("acct", limit, cursor, &PullScope::default())
                    .await?;
                Ok((pull.events, pull.next_cursor, pull.has_more))
            }
            Self::Direct(tailer) => {
                let pull = tailer.pull(cursor, limit).await?;
                Ok((pull.events, Some(pull.next_cursor), pull.has_more))
            }
        }
    }
}

pub struct AccountingPoller {
    pub source: FeedSource,
    pub reconciler: Arc<Reconciler>,
    pub persister: Arc<Persister>,
    pub store: Arc<Store>,
    pub config: Arc<ConfigStore>,
    /// Key for the durable cursor in the offsets table.
    pub cursor_key: String,
}

impl AccountingPoller {
    /// Run until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<Signal>) {
        info!(key = %self.cursor_key, "accounting poller starting");

        let mut cursor: Option<String> = match self
            .store
            .get::<String>(Table::Offsets, &self.cursor_key)
            .await
        {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(error = %e, "cursor load failed, starting from scratch");
                None
            }
        };

        loop {
            let policy = self.config.snapshot();
            let interval = Duration::from_secs_f64(policy.bridge_interval_secs.max(0.5));
            let limit = policy.bridge_max_lines;

            let has_more = match self.source.pull(cursor.as_deref(), limit).await {
                Ok((events, next_cursor, has_more)) => {
                    self.settle(&events).await;

                    // Use exactly the cursor the feed returned; never
                    // fabricate one.
                    if let Some(next_cursor) = next_cursor {
                        if cursor.as_deref() != Some(next_cursor.as_str()) {
                            if let Err(e) = self
                                .store
                                .put(Table::Offsets, &self.cursor_key, &next_cursor)
                                .await
                            {
                                warn!(error = %e, "cursor persist failed");
                            }
                            cursor = Some(next_cursor);
                        }
                    }
                    has_more
                }
                Err(e) => {
                    // Cursor stays as it was; the next tick retries.
                    warn!(error = %e, "accounting pull failed");
                    false
                }
            };

            if has_more {
                // Drain immediately, but stay responsive to shutdown.
                if shutdown.try_recv().is_ok() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.recv() => break,
            }
        }

        info!(key = %self.cursor_key, "accounting poller stopped");
    }

    async fn settle(&self, events: &[AccountingEvent]) {
        if events.is_empty() {
            return;
        }
        let mut applied = 0usize;
        let mut touched: Vec<String> = Vec::new();
        for event in events {
            if let crate::reconcile::ReconcileOutcome::Applied { job_id } =
                self.reconciler.apply(event)
            {
                applied += 1;
                if !touched.contains(&job_id) {
                    touched.push(job_id);
                }
            }
        }
        debug!(applied, total = events.len(), "events reconciled");

        // Mirror reconciled state to durable storage, throttled per job.
        for job_id in touched {
            if let Some(job) = self.reconciler_jobs().get(&job_id) {
                self.persister.maybe_persist(&job, false).await;
            }
        }
    }

    fn reconciler_jobs(&self) -> &Arc<crate::reconcile::JobTable> {
        self.reconciler.jobs()
    }
}
