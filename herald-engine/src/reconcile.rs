//! Event reconciliation: accounting rows back onto jobs.

use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use dashmap::DashMap;
use herald_accounting::AccountingEvent;
use herald_common::address::normalize_recipient;
use tracing::{debug, trace};

use crate::{
    ids::parse_message_id,
    job::{ErrorSample, Job, ResponseClass},
    outcome::{OutcomeStatus, OutcomeStore},
    registry::RecipientRegistry,
};

/// All live jobs, by id.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: DashMap<String, Arc<Job>>,
}

impl JobTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Arc<Job>) {
        self.jobs.insert(job.id.clone(), job);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.get(id).map(|job| job.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.remove(id).map(|(_, job)| job)
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Job>> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }

    /// The non-terminal job for a campaign, if any.
    #[must_use]
    pub fn active_by_campaign(&self, campaign_id: &str) -> Option<Arc<Job>> {
        self.jobs
            .iter()
            .map(|entry| entry.value().clone())
            .find(|job| job.campaign_id == campaign_id && job.is_active())
    }
}

/// Where an event went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied { job_id: String },
    Dropped { reason: &'static str },
}

pub struct Reconciler {
    jobs: Arc<JobTable>,
    outcomes: Arc<OutcomeStore>,
    registry: Arc<RecipientRegistry>,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        jobs: Arc<JobTable>,
        outcomes: Arc<OutcomeStore>,
        registry: Arc<RecipientRegistry>,
    ) -> Self {
        Self {
            jobs,
            outcomes,
            registry,
        }
    }

    #[must_use]
    pub fn jobs(&self) -> &Arc<JobTable> {
        &self.jobs
    }

    /// Apply one normalized event: resolve the job, promote the outcome row,
    /// mirror the aggregate counters, record the response class.
    pub fn apply(&self, event: &AccountingEvent) -> ReconcileOutcome {
        let Some(status) = OutcomeStatus::from_kind(event.kind) else {
            trace!(recipient = %event.recipient, "dropping unknown-outcome event");
            return ReconcileOutcome::Dropped {
                reason: "unknown_outcome",
            };
        };

        let recipient = normalize_recipient(&event.recipient);
        let Some(job) = self.resolve_job(event, &recipient) else {
            debug!(recipient = %recipient, "no job for accounting event");
            return ReconcileOutcome::Dropped {
                reason: "job_not_found",
            };
        };

        let minute = event_minute(event);
        let class = classify_response(event);

        // One critical section per event: promotion and the counter swap
        // stay atomic, so bucket counts always equal the distinct
        // recipients in each status.
        job.with_state(|state| {
            let applied = self.outcomes.apply(&job.id, &recipient, status);
            if applied.changed {
                state.counters.swap_outcome(applied.previous, status);
            }
            state.record_outcome_tick(minute, event.kind);

            match class {
                ResponseClass::Accepted => state.response_classes.accepted += 1,
                ResponseClass::TemporaryError => state.response_classes.temporary_error += 1,
                ResponseClass::Blocked => state.response_classes.blocked += 1,
            }
            if class != ResponseClass::Accepted {
                state.push_error_sample(ErrorSample {
                    recipient: recipient.clone(),
                    class,
                    detail: event
                        .dsn_diag
                        .clone()
                        .or_else(|| event.dsn_status.clone())
                        .unwrap_or_default(),
                    at: Utc::now().timestamp(),
                });
            }

            state.mark_dirty();
        });

        ReconcileOutcome::Applied {
            job_id: job.id.clone(),
        }
    }

    /// Resolution order: explicit job id, message-id pattern, active job by
    /// campaign, registry by recipient.
    fn resolve_job(&self, event: &AccountingEvent, recipient: &str) -> Option<Arc<Job>> {
        if let Some(job_id) = &event.job_id {
            if let Some(job) = self.jobs.get(job_id.trim()) {
                return Some(job);
            }
        }

        if let Some(message_id) = &event.message_id {
            if let Some(parts) = parse_message_id(message_id) {
                if let Some(job) = self.jobs.get(&parts.job_id) {
                    return Some(job);
                }
            }
        }

        if let Some(campaign_id) = &event.campaign_id {
            if let Some(job) = self.jobs.active_by_campaign(campaign_id.trim()) {
                return Some(job);
            }
        }

        for entry in self.registry.candidates(recipient) {
            if let Some(job) = self.jobs.get(&entry.job_id) {
                if job.is_active() {
                    return Some(job);
                }
            }
        }
        // Fall back to any known job for the recipient so late accounting
        // still reconciles after a restart.
        self.registry
            .candidates(recipient)
            .into_iter()
            .find_map(|entry| self.jobs.get(&entry.job_id))
    }
}

/// Epoch minute for the outcome series: event time when parseable, now
/// otherwise.
fn event_minute(event: &AccountingEvent) -> i64 {
    let at = event
        .time_logged
        .as_deref()
        .and_then(parse_event_time)
        .unwrap_or_else(|| Utc::now().timestamp());
    at.div_euclid(60)
}

fn parse_event_time(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(epoch) = raw.parse::<i64>() {
        // Plausible epoch seconds only.
        if epoch > 1_000_000_000 {
            return Some(epoch);
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc().timestamp());
        }
    }
    None
}

/// Response class from the DSN fields, kind as the fallback.
fn classify_response(event: &AccountingEvent) -> ResponseClass {
    for field in [&event.dsn_status, &event.dsn_diag] {
        if let Some(text) = field {
            if let Some(class) = class_from_text(text) {
                return class;
            }
        }
    }
    match event.kind {
        herald_accounting::OutcomeKind::Delivered => ResponseClass::Accepted,
        herald_accounting::OutcomeKind::Deferred => ResponseClass::TemporaryError,
        _ => ResponseClass::Blocked,
    }
}

fn class_from_text(text: &str) -> Option<ResponseClass> {
    let text = text.trim();
    for (prefix, class) in [
        ("2", ResponseClass::Accepted),
        ("4", ResponseClass::TemporaryError),
        ("5", ResponseClass::Blocked),
    ] {
        if text.starts_with(prefix)
            && text[prefix.len()..]
                .chars()
                .next()
                .is_some_and(|c| c == '.' || c.is_ascii_digit())
        {
            return Some(class);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use herald_accounting::OutcomeKind;

    use super::*;
    use crate::job::JobStatus;
    use crate::spec::JobSpec;

    fn spec(campaign: &str) -> JobSpec {
        serde_json::from_value(serde_json::json!({
            "campaign_id": campaign,
            "smtp": {"host": "mta.example"},
            "senders": [{"name": "", "email": "news@sender.example"}],
            "bodies": ["hello"],
            "recipients": ["alice@example.com"]
        }))
        .unwrap()
    }

    struct Fixture {
        jobs: Arc<JobTable>,
        outcomes: Arc<OutcomeStore>,
        registry: Arc<RecipientRegistry>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let jobs = Arc::new(JobTable::new());
        let outcomes = Arc::new(OutcomeStore::new());
        let registry = Arc::new(RecipientRegistry::new());
        let reconciler = Reconciler::new(jobs.clone(), outcomes.clone(), registry.clone());
        Fixture {
            jobs,
            outcomes,
            registry,
            reconciler,
        }
    }

    fn add_job(fixture: &Fixture, id: &str, campaign: &str) -> Arc<Job> {
        let job = Arc::new(Job::new(id.to_string(), spec(campaign)));
        job.with_state(|state| state.status = JobStatus::Running);
        fixture.jobs.insert(job.clone());
        job
    }

    fn event(kind: OutcomeKind, recipient: &str, message_id: Option<&str>) -> AccountingEvent {
        AccountingEvent {
            kind,
            recipient: recipient.to_string(),
            message_id: message_id.map(ToString::to_string),
            ..AccountingEvent::default()
        }
    }

    #[test]
    fn test_single_delivered() {
        let fixture = fixture();
        let job = add_job(&fixture, "abcdef123456", "camp001");

        let outcome = fixture.reconciler.apply(&event(
            OutcomeKind::Delivered,
            "alice@example.com",
            Some("<u1.abcdef123456.camp001.c0.w0@local>"),
        ));
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                job_id: "abcdef123456".to_string()
            }
        );
        job.with_state(|state| {
            assert_eq!(state.counters.delivered, 1);
            assert_eq!(state.counters.bounced, 0);
        });
        assert_eq!(
            fixture.outcomes.row("abcdef123456", "alice@example.com"),
            Some(OutcomeStatus::Delivered)
        );
    }

    #[test]
    fn test_deferred_then_delivered() {
        let fixture = fixture();
        let job = add_job(&fixture, "abcdef123456", "camp001");
        let message_id = Some("<u1.abcdef123456.camp001.c0.w0@local>");

        fixture
            .reconciler
            .apply(&event(OutcomeKind::Deferred, "bob@example.com", message_id));
        job.with_state(|state| assert_eq!(state.counters.deferred, 1));

        fixture
            .reconciler
            .apply(&event(OutcomeKind::Delivered, "bob@example.com", message_id));
        job.with_state(|state| {
            assert_eq!(state.counters.deferred, 0);
            assert_eq!(state.counters.delivered, 1);
        });
        assert_eq!(
            fixture.outcomes.row("abcdef123456", "bob@example.com"),
            Some(OutcomeStatus::Delivered)
        );
    }

    #[test]
    fn test_outcome_idempotence() {
        let fixture = fixture();
        let job = add_job(&fixture, "abcdef123456", "camp001");
        let ev = event(
            OutcomeKind::Bounced,
            "carol@example.com",
            Some("<u1.abcdef123456.camp001.c0.w0@local>"),
        );

        fixture.reconciler.apply(&ev);
        fixture.reconciler.apply(&ev);
        job.with_state(|state| assert_eq!(state.counters.bounced, 1));
        let counts = fixture.outcomes.counts("abcdef123456");
        assert_eq!(counts.get(&OutcomeStatus::Bounced), Some(&1));
    }

    #[test]
    fn test_counter_invariant_matches_store() {
        let fixture = fixture();
        let job = add_job(&fixture, "abcdef123456", "camp001");
        let message_id = Some("<u1.abcdef123456.camp001.c0.w0@local>");

        for (kind, recipient) in [
            (OutcomeKind::Delivered, "a@example.com"),
            (OutcomeKind::Deferred, "b@example.com"),
            (OutcomeKind::Delivered, "b@example.com"),
            (OutcomeKind::Bounced, "c@example.com"),
            (OutcomeKind::Bounced, "a@example.com"),
            (OutcomeKind::Complained, "d@example.com"),
        ] {
            fixture.reconciler.apply(&event(kind, recipient, message_id));
        }

        let counts = fixture.outcomes.counts("abcdef123456");
        job.with_state(|state| {
            assert_eq!(
                state.counters.delivered,
                counts.get(&OutcomeStatus::Delivered).copied().unwrap_or(0)
            );
            assert_eq!(
                state.counters.bounced,
                counts.get(&OutcomeStatus::Bounced).copied().unwrap_or(0)
            );
            assert_eq!(
                state.counters.deferred,
                counts.get(&OutcomeStatus::Deferred).copied().unwrap_or(0)
            );
            assert_eq!(
                state.counters.complained,
                counts.get(&OutcomeStatus::Complained).copied().unwrap_or(0)
            );
        });
    }

    #[test]
    fn test_resolution_by_campaign_and_registry() {
        let fixture = fixture();
        add_job(&fixture, "abcdef123456", "camp001");

        // By campaign id.
        let by_campaign = AccountingEvent {
            kind: OutcomeKind::Delivered,
            recipient: "eve@example.com".to_string(),
            campaign_id: Some("camp001".to_string()),
            ..AccountingEvent::default()
        };
        assert!(matches!(
            fixture.reconciler.apply(&by_campaign),
            ReconcileOutcome::Applied { .. }
        ));

        // By registry, nothing else present.
        fixture
            .registry
            .record("abcdef123456", "camp001", "frank@example.com");
        let bare = event(OutcomeKind::Bounced, "frank@example.com", None);
        assert!(matches!(
            fixture.reconciler.apply(&bare),
            ReconcileOutcome::Applied { .. }
        ));

        // Nothing matches.
        let orphan = event(OutcomeKind::Delivered, "nobody@example.com", None);
        assert_eq!(
            fixture.reconciler.apply(&orphan),
            ReconcileOutcome::Dropped {
                reason: "job_not_found"
            }
        );
    }

    #[test]
    fn test_unknown_kind_dropped() {
        let fixture = fixture();
        add_job(&fixture, "abcdef123456", "camp001");
        let outcome = fixture.reconciler.apply(&event(
            OutcomeKind::Unknown,
            "alice@example.com",
            Some("<u1.abcdef123456.camp001.c0.w0@local>"),
        ));
        assert_eq!(
            outcome,
            ReconcileOutcome::Dropped {
                reason: "unknown_outcome"
            }
        );
    }

    #[test]
    fn test_classify_response() {
        let mut ev = event(OutcomeKind::Deferred, "a@example.com", None);
        ev.dsn_status = Some("4.4.1".to_string());
        assert_eq!(classify_response(&ev), ResponseClass::TemporaryError);

        let mut ev = event(OutcomeKind::Bounced, "a@example.com", None);
        ev.dsn_diag = Some("550 5.1.1 unknown user".to_string());
        assert_eq!(classify_response(&ev), ResponseClass::Blocked);

        let ev = event(OutcomeKind::Delivered, "a@example.com", None);
        assert_eq!(classify_response(&ev), ResponseClass::Accepted);
    }

    #[test]
    fn test_event_minute_parses_csv_time() {
        let mut ev = event(OutcomeKind::Delivered, "a@example.com", None);
        ev.time_logged = Some("2026-03-01 10:00:01".to_string());
        let minute = event_minute(&ev);
        assert_eq!(minute * 60, 1_772_359_201 - 1);
    }
}
