//! The job aggregate: status, counters, bounded histories.
//!
//! All mutable job state lives behind one mutex so counters, rings and the
//! outcome buckets cannot drift apart. Everything that touches a job routes
//! through [`Job::with_state`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use herald_accounting::OutcomeKind;
use herald_common::Domain;
use herald_monitor::OutcomeWindow;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::outcome::OutcomeStatus;
use crate::spec::JobSpec;

/// Ring bounds. Snapshots carry the same bounds so persisted jobs cannot
/// grow without limit.
pub const RECENT_RESULTS_CAP: usize = 400;
pub const CHUNK_LOG_CAP: usize = 200;
pub const SERIES_CAP: usize = 180;
pub const ERROR_SAMPLES_CAP: usize = 80;
pub const OUTCOME_WINDOW_CAP: usize = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Backoff,
    Paused,
    Stopped,
    Done,
    Error,
}

impl JobStatus {
    /// Terminal jobs persist but never resume.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Done | Self::Error)
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Backoff => "backoff",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// Send failure classes for the per-category histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureCategory {
    Timeout,
    Auth,
    Refused,
    Dns,
    Connection,
    Other,
}

impl FailureCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::Refused => "refused",
            Self::Dns => "dns",
            Self::Connection => "connection",
            Self::Other => "other",
        }
    }
}

/// One per-recipient send result, kept in a bounded ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentResult {
    pub recipient: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPhase {
    Running,
    Done,
    DoneAfterBackoff,
    Backoff,
    Deferred,
    Abandoned,
}

/// One chunk state transition, kept in a bounded ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkState {
    pub index: u32,
    pub domain: String,
    pub size: usize,
    pub attempt: u32,
    pub sender: String,
    pub phase: ChunkPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub at: i64,
}

/// SMTP response classes tracked for the pressure controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseClass {
    Accepted,
    TemporaryError,
    Blocked,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResponseClassCounters {
    pub accepted: u64,
    pub temporary_error: u64,
    pub blocked: u64,
}

/// A non-accepted response sample, kept in a bounded ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSample {
    pub recipient: String,
    pub class: ResponseClass,
    pub detail: String,
    pub at: i64,
}

/// One minute of reconciled outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeBucket {
    pub delivered: u64,
    pub bounced: u64,
    pub deferred: u64,
    pub complained: u64,
}

impl OutcomeBucket {
    pub fn add(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Delivered => self.delivered += 1,
            OutcomeKind::Bounced => self.bounced += 1,
            OutcomeKind::Deferred => self.deferred += 1,
            OutcomeKind::Complained => self.complained += 1,
            OutcomeKind::Unknown => {}
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
    pub invalid: u64,
    pub delivered: u64,
    pub bounced: u64,
    pub deferred: u64,
    pub complained: u64,
}

impl JobCounters {
    /// Decrement the bucket a recipient is leaving and increment the one it
    /// is entering, in one step so the books always balance.
    pub fn swap_outcome(&mut self, from: Option<OutcomeStatus>, to: OutcomeStatus) {
        if let Some(from) = from {
            let slot = self.outcome_slot(from);
            *slot = slot.saturating_sub(1);
        }
        *self.outcome_slot(to) += 1;
    }

    fn outcome_slot(&mut self, status: OutcomeStatus) -> &mut u64 {
        match status {
            OutcomeStatus::Delivered => &mut self.delivered,
            OutcomeStatus::Bounced => &mut self.bounced,
            OutcomeStatus::Deferred => &mut self.deferred,
            OutcomeStatus::Complained => &mut self.complained,
        }
    }
}

/// Everything mutable about a job.
#[derive(Debug)]
pub struct JobState {
    pub status: JobStatus,
    pub counters: JobCounters,
    pub domain_plan: AHashMap<String, u64>,
    pub domain_sent: AHashMap<String, u64>,
    pub domain_failed: AHashMap<String, u64>,
    pub chunks_total: u32,
    pub chunks_done: u32,
    pub chunks_backoff: u32,
    pub chunks_abandoned: u32,
    pub recent: VecDeque<RecentResult>,
    pub chunk_log: VecDeque<ChunkState>,
    /// Per-minute outcome series keyed by epoch minute.
    pub series: VecDeque<(i64, OutcomeBucket)>,
    pub response_classes: ResponseClassCounters,
    pub error_samples: VecDeque<ErrorSample>,
    /// Rolling window of reconciled outcome kinds for pressure ratios.
    pub recent_outcomes: VecDeque<OutcomeKind>,
    pub failure_categories: AHashMap<FailureCategory, u64>,
    pub spam_threshold: f64,
    pub last_error: Option<String>,
    pub stop_reason: Option<String>,
    pub paused: bool,
    pub stop_requested: bool,
    /// Persistence throttle bookkeeping.
    pub pending_events: u32,
    pub last_persist_at: Option<Instant>,
    /// Per-domain rate limit for diagnostic snapshots.
    pub last_diag_at: AHashMap<String, Instant>,
}

impl JobState {
    fn new(spam_threshold: f64) -> Self {
        Self {
            status: JobStatus::Queued,
            counters: JobCounters::default(),
            domain_plan: AHashMap::new(),
            domain_sent: AHashMap::new(),
            domain_failed: AHashMap::new(),
            chunks_total: 0,
            chunks_done: 0,
            chunks_backoff: 0,
            chunks_abandoned: 0,
            recent: VecDeque::new(),
            chunk_log: VecDeque::new(),
            series: VecDeque::new(),
            response_classes: ResponseClassCounters::default(),
            error_samples: VecDeque::new(),
            recent_outcomes: VecDeque::new(),
            failure_categories: AHashMap::new(),
            spam_threshold,
            last_error: None,
            stop_reason: None,
            paused: false,
            stop_requested: false,
            pending_events: 0,
            last_persist_at: None,
            last_diag_at: AHashMap::new(),
        }
    }

    pub fn push_recent(&mut self, result: RecentResult) {
        push_bounded(&mut self.recent, result, RECENT_RESULTS_CAP);
    }

    pub fn push_chunk_state(&mut self, state: ChunkState) {
        push_bounded(&mut self.chunk_log, state, CHUNK_LOG_CAP);
    }

    pub fn push_error_sample(&mut self, sample: ErrorSample) {
        push_bounded(&mut self.error_samples, sample, ERROR_SAMPLES_CAP);
    }

    /// Append one reconciled outcome to the minute series and the rolling
    /// window.
    pub fn record_outcome_tick(&mut self, minute: i64, kind: OutcomeKind) {
        match self.series.back_mut() {
            Some((bucket_minute, bucket)) if *bucket_minute == minute => bucket.add(kind),
            _ => {
                let mut bucket = OutcomeBucket::default();
                bucket.add(kind);
                push_bounded(&mut self.series, (minute, bucket), SERIES_CAP);
            }
        }
        push_bounded(&mut self.recent_outcomes, kind, OUTCOME_WINDOW_CAP);
    }

    /// The rolling view the pressure controller consumes.
    #[must_use]
    pub fn outcome_window(&self) -> OutcomeWindow {
        let mut window = OutcomeWindow {
            total: self.recent_outcomes.len(),
            ..OutcomeWindow::default()
        };
        for kind in &self.recent_outcomes {
            match kind {
                OutcomeKind::Bounced => window.bounced += 1,
                OutcomeKind::Complained => window.complained += 1,
                OutcomeKind::Deferred => window.deferred += 1,
                _ => {}
            }
        }
        for sample in &self.error_samples {
            window.failures += 1;
            match sample.class {
                ResponseClass::TemporaryError => window.fourxx += 1,
                ResponseClass::Blocked => window.fivexx += 1,
                ResponseClass::Accepted => {}
            }
        }
        window
    }

    pub fn mark_dirty(&mut self) {
        self.pending_events = self.pending_events.saturating_add(1);
    }
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, cap: usize) {
    if ring.len() >= cap {
        ring.pop_front();
    }
    ring.push_back(item);
}

/// A job: immutable identity plus the guarded state.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub campaign_id: String,
    /// Epoch seconds.
    pub created_at: i64,
    pub smtp_host: String,
    pub spec: Arc<JobSpec>,
    state: Mutex<JobState>,
}

impl Job {
    #[must_use]
    pub fn new(id: String, spec: JobSpec) -> Self {
        let spam_threshold = spec.spam_threshold;
        Self {
            campaign_id: spec.campaign_id.clone(),
            smtp_host: spec.smtp.host.clone(),
            created_at: chrono::Utc::now().timestamp(),
            id,
            spec: Arc::new(spec),
            state: Mutex::new(JobState::new(spam_threshold)),
        }
    }

    /// Run `f` under the job lock. The single serializer for all mutation.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut JobState) -> R) -> R {
        f(&mut self.state.lock())
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        let state = self.state.lock();
        state.stop_requested
    }

    #[must_use]
    pub fn paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Record an accepted submission.
    pub fn record_send_success(&self, recipient: &str, domain: &Domain) {
        self.with_state(|state| {
            state.counters.sent += 1;
            *state.domain_sent.entry(domain.to_string()).or_default() += 1;
            state.push_recent(RecentResult {
                recipient: recipient.to_string(),
                ok: true,
                category: None,
                detail: None,
                at: chrono::Utc::now().timestamp(),
            });
            state.mark_dirty();
        });
    }

    /// Record a failed submission with its category and, for SMTP status
    /// failures, the response class sample used by the pressure ratios.
    pub fn record_send_failure(
        &self,
        recipient: &str,
        domain: &Domain,
        category: FailureCategory,
        code: Option<u16>,
        detail: String,
    ) {
        self.with_state(|state| {
            state.counters.failed += 1;
            *state.domain_failed.entry(domain.to_string()).or_default() += 1;
            *state.failure_categories.entry(category).or_default() += 1;
            let class = match code {
                Some(code) if (500..600).contains(&code) => ResponseClass::Blocked,
                _ => ResponseClass::TemporaryError,
            };
            state.push_error_sample(ErrorSample {
                recipient: recipient.to_string(),
                class,
                detail: detail.clone(),
                at: chrono::Utc::now().timestamp(),
            });
            state.push_recent(RecentResult {
                recipient: recipient.to_string(),
                ok: false,
                category: Some(category),
                detail: Some(detail),
                at: chrono::Utc::now().timestamp(),
            });
            state.mark_dirty();
        });
    }
}

/// Durable snapshot of one job. Bounded by construction: rings carry their
/// in-memory caps, the spec is redacted of payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub campaign_id: String,
    pub created_at: i64,
    pub smtp_host: String,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub domain_plan: AHashMap<String, u64>,
    pub domain_sent: AHashMap<String, u64>,
    pub domain_failed: AHashMap<String, u64>,
    pub chunks_total: u32,
    pub chunks_done: u32,
    pub chunks_backoff: u32,
    pub chunks_abandoned: u32,
    pub recent: Vec<RecentResult>,
    pub chunk_log: Vec<ChunkState>,
    pub series: Vec<(i64, OutcomeBucket)>,
    pub response_classes: ResponseClassCounters,
    pub error_samples: Vec<ErrorSample>,
    pub failure_categories: AHashMap<FailureCategory, u64>,
    pub spam_threshold: f64,
    pub last_error: Option<String>,
    pub stop_reason: Option<String>,
    pub spec: JobSpec,
}

impl Job {
    /// Build the durable snapshot under the job lock.
    #[must_use]
    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state.lock();
        JobSnapshot {
            id: self.id.clone(),
            campaign_id: self.campaign_id.clone(),
            created_at: self.created_at,
            smtp_host: self.smtp_host.clone(),
            status: state.status,
            counters: state.counters,
            domain_plan: state.domain_plan.clone(),
            domain_sent: state.domain_sent.clone(),
            domain_failed: state.domain_failed.clone(),
            chunks_total: state.chunks_total,
            chunks_done: state.chunks_done,
            chunks_backoff: state.chunks_backoff,
            chunks_abandoned: state.chunks_abandoned,
            recent: state.recent.iter().cloned().collect(),
            chunk_log: state.chunk_log.iter().cloned().collect(),
            series: state.series.iter().copied().collect(),
            response_classes: state.response_classes,
            error_samples: state.error_samples.iter().cloned().collect(),
            failure_categories: state.failure_categories.clone(),
            spam_threshold: state.spam_threshold,
            last_error: state.last_error.clone(),
            stop_reason: state.stop_reason.clone(),
            spec: self.spec.redacted(),
        }
    }

    /// Rebuild a job from its snapshot. Jobs that were active when the
    /// snapshot was taken come back `stopped`, reason "restored from DB".
    #[must_use]
    pub fn from_snapshot(snapshot: JobSnapshot) -> Self {
        let restored_active = snapshot.status.is_active();
        let job = Self {
            id: snapshot.id,
            campaign_id: snapshot.campaign_id,
            created_at: snapshot.created_at,
            smtp_host: snapshot.smtp_host,
            spec: Arc::new(snapshot.spec),
            state: Mutex::new(JobState::new(snapshot.spam_threshold)),
        };
        job.with_state(|state| {
            state.status = if restored_active {
                JobStatus::Stopped
            } else {
                snapshot.status
            };
            if restored_active {
                state.stop_reason = Some("restored from DB".to_string());
            } else {
                state.stop_reason = snapshot.stop_reason;
            }
            state.counters = snapshot.counters;
            state.domain_plan = snapshot.domain_plan;
            state.domain_sent = snapshot.domain_sent;
            state.domain_failed = snapshot.domain_failed;
            state.chunks_total = snapshot.chunks_total;
            state.chunks_done = snapshot.chunks_done;
            state.chunks_backoff = snapshot.chunks_backoff;
            state.chunks_abandoned = snapshot.chunks_abandoned;
            state.recent = snapshot.recent.into_iter().collect();
            state.chunk_log = snapshot.chunk_log.into_iter().collect();
            state.series = snapshot.series.into_iter().collect();
            state.response_classes = snapshot.response_classes;
            state.error_samples = snapshot.error_samples.into_iter().collect();
            state.failure_categories = snapshot.failure_categories;
            state.last_error = snapshot.last_error;
        });
        job
    }
}

/// The operator-facing status view, bounded histories included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: String,
    pub campaign_id: String,
    pub created_at: i64,
    pub smtp_host: String,
    pub status: JobStatus,
    pub counters: JobCounters,
    pub domain_plan: AHashMap<String, u64>,
    pub domain_sent: AHashMap<String, u64>,
    pub domain_failed: AHashMap<String, u64>,
    pub chunks_total: u32,
    pub chunks_done: u32,
    pub chunks_backoff: u32,
    pub chunks_abandoned: u32,
    pub recent: Vec<RecentResult>,
    pub chunk_log: Vec<ChunkState>,
    pub series: Vec<(i64, OutcomeBucket)>,
    pub response_classes: ResponseClassCounters,
    pub failure_categories: AHashMap<FailureCategory, u64>,
    pub last_error: Option<String>,
    pub stop_reason: Option<String>,
}

impl Job {
    #[must_use]
    pub fn status_view(&self, history_limit: usize) -> JobStatusView {
        let state = self.state.lock();
        JobStatusView {
            id: self.id.clone(),
            campaign_id: self.campaign_id.clone(),
            created_at: self.created_at,
            smtp_host: self.smtp_host.clone(),
            status: state.status,
            counters: state.counters,
            domain_plan: state.domain_plan.clone(),
            domain_sent: state.domain_sent.clone(),
            domain_failed: state.domain_failed.clone(),
            chunks_total: state.chunks_total,
            chunks_done: state.chunks_done,
            chunks_backoff: state.chunks_backoff,
            chunks_abandoned: state.chunks_abandoned,
            recent: state
                .recent
                .iter()
                .rev()
                .take(history_limit)
                .cloned()
                .collect(),
            chunk_log: state
                .chunk_log
                .iter()
                .rev()
                .take(history_limit)
                .cloned()
                .collect(),
            series: state.series.iter().copied().collect(),
            response_classes: state.response_classes,
            failure_categories: state.failure_categories.clone(),
            last_error: state.last_error.clone(),
            stop_reason: state.stop_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> JobSpec {
        serde_json::from_value(serde_json::json!({
            "campaign_id": "camp001",
            "smtp": {"host": "mta.example"},
            "senders": [{"name": "", "email": "news@sender.example"}],
            "bodies": ["hello"],
            "recipients": ["alice@example.com"]
        }))
        .unwrap()
    }

    #[test]
    fn test_counters_swap_outcome() {
        let mut counters = JobCounters::default();
        counters.swap_outcome(None, OutcomeStatus::Deferred);
        assert_eq!(counters.deferred, 1);

        counters.swap_outcome(Some(OutcomeStatus::Deferred), OutcomeStatus::Delivered);
        assert_eq!(counters.deferred, 0);
        assert_eq!(counters.delivered, 1);
    }

    #[test]
    fn test_rings_are_bounded() {
        let job = Job::new("abcdef123456".to_string(), test_spec());
        let domain = Domain::new("example.com");
        for i in 0..(RECENT_RESULTS_CAP + 50) {
            job.record_send_success(&format!("user{i}@example.com"), &domain);
        }
        job.with_state(|state| {
            assert_eq!(state.recent.len(), RECENT_RESULTS_CAP);
            assert_eq!(state.counters.sent, (RECENT_RESULTS_CAP + 50) as u64);
        });
    }

    #[test]
    fn test_outcome_series_buckets_by_minute() {
        let job = Job::new("abcdef123456".to_string(), test_spec());
        job.with_state(|state| {
            state.record_outcome_tick(100, OutcomeKind::Delivered);
            state.record_outcome_tick(100, OutcomeKind::Bounced);
            state.record_outcome_tick(101, OutcomeKind::Delivered);
            assert_eq!(state.series.len(), 2);
            assert_eq!(state.series[0].1.delivered, 1);
            assert_eq!(state.series[0].1.bounced, 1);
            assert_eq!(state.series[1].1.delivered, 1);
        });
    }

    #[test]
    fn test_outcome_window_ratios() {
        let job = Job::new("abcdef123456".to_string(), test_spec());
        job.with_state(|state| {
            for _ in 0..8 {
                state.record_outcome_tick(1, OutcomeKind::Delivered);
            }
            state.record_outcome_tick(1, OutcomeKind::Bounced);
            state.record_outcome_tick(1, OutcomeKind::Deferred);
            let window = state.outcome_window();
            assert_eq!(window.total, 10);
            assert_eq!(window.bounced, 1);
            assert_eq!(window.deferred, 1);
            assert!((window.bad_ratio() - 0.16).abs() < 1e-9);
        });
    }

    #[test]
    fn test_restore_active_job_is_stopped() {
        let job = Job::new("abcdef123456".to_string(), test_spec());
        job.with_state(|state| {
            state.status = JobStatus::Running;
            state.counters.sent = 5;
        });
        let snapshot = job.snapshot();
        // Bodies never persist.
        assert!(snapshot.spec.bodies.is_empty());

        let restored = Job::from_snapshot(snapshot);
        assert_eq!(restored.status(), JobStatus::Stopped);
        restored.with_state(|state| {
            assert!(state
                .stop_reason
                .as_deref()
                .is_some_and(|reason| reason.starts_with("restored")));
            assert_eq!(state.counters.sent, 5);
        });
    }

    #[test]
    fn test_terminal_status_survives_restore() {
        let job = Job::new("abcdef123456".to_string(), test_spec());
        job.with_state(|state| {
            state.status = JobStatus::Done;
        });
        let restored = Job::from_snapshot(job.snapshot());
        assert_eq!(restored.status(), JobStatus::Done);
    }
}
