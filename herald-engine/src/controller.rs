//! Job lifecycle control.
//!
//! Owns the job table, enforces the per-campaign anti-duplication guard,
//! spawns scheduler tasks, and handles the cooperative pause / resume /
//! stop / delete operations. On process start it rehydrates persisted jobs;
//! anything that was active when the snapshot was taken comes back stopped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use herald_common::{ConfigStore, Signal};
use herald_monitor::{MonitorClient, PressureController};
use herald_preflight::PreflightGate;
use herald_store::Table;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    ids::new_job_id,
    job::{Job, JobSnapshot, JobStatus, JobStatusView},
    outcome::OutcomeStore,
    persist::Persister,
    reconcile::JobTable,
    registry::RecipientRegistry,
    scheduler::Scheduler,
    spec::JobSpec,
};

/// Start failures, mapped by the operator surface onto its status codes
/// (validation 400, conflict 409, monitor-busy 503).
#[derive(Debug, Error)]
pub enum StartError {
    #[error("{0}")]
    Validation(String),

    #[error("campaign {0} already has an active job")]
    Conflict(String),

    #[error("MTA monitor unavailable: {0}")]
    MonitorBusy(String),
}

/// Failures for the per-job operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpError {
    #[error("no such job: {0}")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),
}

pub struct JobController {
    jobs: Arc<JobTable>,
    outcomes: Arc<OutcomeStore>,
    registry: Arc<RecipientRegistry>,
    config: Arc<ConfigStore>,
    persister: Arc<Persister>,
    pressure: Arc<PressureController>,
    gate: Arc<PreflightGate>,
    monitor: Option<Arc<MonitorClient>>,
    shutdown: broadcast::Sender<Signal>,
    /// campaign → guard taken at. Entries expire after the guard TTL.
    start_guards: Mutex<AHashMap<String, Instant>>,
}

impl JobController {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        jobs: Arc<JobTable>,
        outcomes: Arc<OutcomeStore>,
        registry: Arc<RecipientRegistry>,
        config: Arc<ConfigStore>,
        persister: Arc<Persister>,
        pressure: Arc<PressureController>,
        gate: Arc<PreflightGate>,
        monitor: Option<Arc<MonitorClient>>,
        shutdown: broadcast::Sender<Signal>,
    ) -> Self {
        Self {
            jobs,
            outcomes,
            registry,
            config,
            persister,
            pressure,
            gate,
            monitor,
            shutdown,
            start_guards: Mutex::new(AHashMap::new()),
        }
    }

    #[must_use]
    pub fn jobs(&self) -> &Arc<JobTable> {
        &self.jobs
    }

    /// Submit a job. Exactly one of two concurrent starts for the same
    /// campaign wins; the loser gets a conflict.
    ///
    /// # Errors
    /// Validation, conflict, or monitor-required failures. No job exists
    /// after an error.
    pub async fn start(&self, spec: JobSpec) -> Result<String, StartError> {
        let policy = self.config.snapshot();
        let input = spec
            .validate(policy.max_rcpt)
            .map_err(|e| StartError::Validation(e.to_string()))?;

        if policy.monitor_strict {
            let reachable = match &self.monitor {
                Some(monitor) if monitor.is_configured() => monitor.status().await.is_ok(),
                _ => false,
            };
            if !reachable {
                return Err(StartError::MonitorBusy(
                    "monitor required but unreachable".to_string(),
                ));
            }
        }

        // Anti-duplication: an active job always wins; within the guard TTL
        // a second start loses even if the first has not created its job
        // yet, unless the caller forces and no active job exists.
        if self.jobs.active_by_campaign(&spec.campaign_id).is_some() {
            return Err(StartError::Conflict(spec.campaign_id.clone()));
        }
        {
            let ttl = Duration::from_secs(policy.campaign_guard_ttl_secs);
            let mut guards = self.start_guards.lock();
            guards.retain(|_, taken_at| taken_at.elapsed() < ttl);
            if guards.contains_key(&spec.campaign_id) && !spec.force_new_job {
                return Err(StartError::Conflict(spec.campaign_id.clone()));
            }
            guards.insert(spec.campaign_id.clone(), Instant::now());
        }

        let job_id = new_job_id();
        let mut spec = spec;
        let invalid = input.invalid;
        let recipients = input.recipients;
        spec.senders = input.senders;

        let job = Arc::new(Job::new(job_id.clone(), spec));
        job.with_state(|state| {
            state.counters.total = recipients.len() as u64;
            state.counters.invalid = invalid as u64;
            state.mark_dirty();
        });
        self.jobs.insert(job.clone());
        self.persister.maybe_persist(&job, true).await;

        let scheduler = Scheduler {
            job: job.clone(),
            recipients,
            config: self.config.clone(),
            pressure: self.pressure.clone(),
            gate: self.gate.clone(),
            registry: self.registry.clone(),
            monitor: self.monitor.clone(),
            persister: self.persister.clone(),
        };
        let mut shutdown = self.shutdown.subscribe();
        let shutdown_job = job.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = scheduler.run() => {}
                _ = shutdown.recv() => {
                    shutdown_job.with_state(|state| {
                        state.stop_requested = true;
                        state.stop_reason = Some("shutdown".to_string());
                    });
                }
            }
        });

        info!(job = %job_id, campaign = %job.campaign_id, "job started");
        Ok(job_id)
    }

    /// Pause: schedulers and workers honor the flag at their next
    /// checkpoint.
    ///
    /// # Errors
    /// Unknown job, or a terminal one.
    pub async fn pause(&self, id: &str) -> Result<(), OpError> {
        let job = self.require_active(id)?;
        job.with_state(|state| {
            state.paused = true;
            state.mark_dirty();
        });
        self.persister.maybe_persist(&job, true).await;
        Ok(())
    }

    /// # Errors
    /// Unknown job, or a terminal one.
    pub async fn resume(&self, id: &str) -> Result<(), OpError> {
        let job = self.require_active(id)?;
        job.with_state(|state| {
            state.paused = false;
            state.mark_dirty();
        });
        self.persister.maybe_persist(&job, true).await;
        Ok(())
    }

    /// Cooperative stop: the in-flight send completes, nothing new starts.
    ///
    /// # Errors
    /// Unknown job.
    pub async fn stop(&self, id: &str, reason: &str) -> Result<(), OpError> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| OpError::NotFound(id.to_string()))?;
        job.with_state(|state| {
            state.stop_requested = true;
            state.paused = false;
            if state.stop_reason.is_none() {
                state.stop_reason = Some(reason.to_string());
            }
            if state.status.is_terminal() {
                // Nothing running; settle immediately.
            } else if state.status == JobStatus::Queued {
                state.status = JobStatus::Stopped;
            }
            state.mark_dirty();
        });
        self.persister.maybe_persist(&job, true).await;
        Ok(())
    }

    /// Delete: force-stop if active, then remove memory and durable state.
    ///
    /// # Errors
    /// Unknown job.
    pub async fn delete(&self, id: &str) -> Result<(), OpError> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| OpError::NotFound(id.to_string()))?;
        if job.is_active() {
            let _ = self.stop(id, "deleted").await;
        }
        self.jobs.remove(id);
        self.outcomes.remove_job(id);
        self.registry.remove_job(id);
        self.persister.remove(id).await;
        info!(job = id, "job deleted");
        Ok(())
    }

    /// # Errors
    /// Unknown job.
    pub fn status(&self, id: &str, history_limit: usize) -> Result<JobStatusView, OpError> {
        self.jobs
            .get(id)
            .map(|job| job.status_view(history_limit))
            .ok_or_else(|| OpError::NotFound(id.to_string()))
    }

    #[must_use]
    pub fn list(&self) -> Vec<JobStatusView> {
        let mut views: Vec<JobStatusView> = self
            .jobs
            .all()
            .iter()
            .map(|job| job.status_view(0))
            .collect();
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        views
    }

    /// Rehydrate persisted jobs. Any job that was active in its snapshot
    /// comes back `stopped` with reason "restored from DB".
    pub async fn restore(&self) {
        let store = self.persister.store();
        let ids = match store.keys(Table::Jobs).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "job table scan failed, nothing restored");
                return;
            }
        };

        let mut restored = 0usize;
        for id in ids {
            let snapshot: Option<JobSnapshot> = match store.get(Table::Jobs, &id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(job = %id, error = %e, "unreadable job snapshot skipped");
                    continue;
                }
            };
            let Some(snapshot) = snapshot else { continue };
            let was_active = snapshot.status.is_active();

            let job = Arc::new(Job::from_snapshot(snapshot));
            if let Ok(Some(rows)) = store
                .get::<ahash::AHashMap<String, crate::outcome::OutcomeStatus>>(Table::Outcomes, &id)
                .await
            {
                self.outcomes.load(&id, rows);
            }
            if let Ok(Some(entries)) = store
                .get::<ahash::AHashMap<String, crate::registry::RegistryEntry>>(Table::Registry, &id)
                .await
            {
                self.registry.load(&id, entries);
            }
            if was_active {
                // Rewrite the durable copy so the restored status sticks.
                self.persister.maybe_persist(&job, true).await;
            }
            self.jobs.insert(job);
            restored += 1;
        }
        info!(restored, "job snapshots rehydrated");
    }

    fn require_active(&self, id: &str) -> Result<Arc<Job>, OpError> {
        let job = self
            .jobs
            .get(id)
            .ok_or_else(|| OpError::NotFound(id.to_string()))?;
        if !job.is_active() {
            return Err(OpError::Invalid(format!(
                "job {id} is {}",
                job.status().as_str()
            )));
        }
        Ok(job)
    }
}
