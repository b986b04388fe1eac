//! The per-job scheduler loop.
//!
//! Recipients are partitioned into per-receiver-domain FIFO buckets at
//! start; a round-robin cursor over the bucket keys keeps any one domain
//! from monopolising the sender. Preflight blocks turn into scoped backoff
//! on the (receiver domain, sender domain) pair; other pairs keep flowing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use herald_common::{ConfigStore, Domain};
use herald_monitor::{CapSet, MonitorClient, PressureController};
use herald_preflight::{ChunkProfile, GateConfig, PreflightGate, Verdict};
use tracing::{debug, info, warn};

use crate::{
    job::{ChunkPhase, ChunkState, Job, JobStatus},
    persist::Persister,
    registry::RecipientRegistry,
    sender::{sliced_wait, ChunkAssignment, SenderPool, WAIT_SLICE},
};

/// A chunk is abandoned after this many blocked attempts.
const MAX_CHUNK_ATTEMPTS: u32 = 6;

/// Per-pair backoff state.
#[derive(Debug, Clone, Copy)]
struct BackoffState {
    next_retry_at: Instant,
    attempts: u32,
}

/// Scoped backoff: a timed pause on one (receiver domain, sender domain)
/// pair. Independent pairs never block each other.
#[derive(Debug, Default)]
pub struct ScopedBackoff {
    pairs: AHashMap<(Domain, Domain), BackoffState>,
}

impl ScopedBackoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts so far for a pair (0 when never blocked).
    #[must_use]
    pub fn attempts(&self, receiver: &Domain, sender: &Domain) -> u32 {
        self.pairs
            .get(&(receiver.clone(), sender.clone()))
            .map_or(0, |state| state.attempts)
    }

    /// Whether the pair is paused right now.
    #[must_use]
    pub fn is_blocked(&self, receiver: &Domain, sender: &Domain, now: Instant) -> bool {
        self.pairs
            .get(&(receiver.clone(), sender.clone()))
            .is_some_and(|state| now < state.next_retry_at)
    }

    /// Register a blocked attempt: `next_retry = now + base * 2^(attempts-1)`,
    /// capped.
    pub fn register(&mut self, receiver: &Domain, sender: &Domain, base: f64, cap: f64) -> u32 {
        let state = self
            .pairs
            .entry((receiver.clone(), sender.clone()))
            .or_insert(BackoffState {
                next_retry_at: Instant::now(),
                attempts: 0,
            });
        state.attempts += 1;
        let exponent = state.attempts.saturating_sub(1).min(16);
        let delay = (base * f64::from(1u32 << exponent)).min(cap).max(0.0);
        state.next_retry_at = Instant::now() + Duration::from_secs_f64(delay);
        state.attempts
    }

    /// Clear the pair after a successful dispatch.
    pub fn clear(&mut self, receiver: &Domain, sender: &Domain) {
        self.pairs.remove(&(receiver.clone(), sender.clone()));
    }

    /// The soonest retry instant across all paused pairs.
    #[must_use]
    pub fn earliest_retry(&self) -> Option<Instant> {
        self.pairs.values().map(|state| state.next_retry_at).min()
    }
}

/// Per-receiver-domain FIFO buckets with a round-robin cursor.
#[derive(Debug)]
pub struct DomainBuckets {
    order: Vec<Domain>,
    buckets: AHashMap<Domain, VecDeque<String>>,
    cursor: usize,
}

impl DomainBuckets {
    /// Partition recipients by receiver domain, preserving first-seen order
    /// both across domains and within each bucket.
    #[must_use]
    pub fn partition(recipients: &[String]) -> Self {
        let mut order = Vec::new();
        let mut buckets: AHashMap<Domain, VecDeque<String>> = AHashMap::new();
        for recipient in recipients {
            let Some(domain) = Domain::of_email(recipient) else {
                continue;
            };
            if !buckets.contains_key(&domain) {
                order.push(domain.clone());
            }
            buckets.entry(domain).or_default().push_back(recipient.clone());
        }
        Self {
            order,
            buckets,
            cursor: 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(VecDeque::is_empty)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    /// Planned counts per domain, taken at start.
    #[must_use]
    pub fn plan(&self) -> AHashMap<String, u64> {
        self.buckets
            .iter()
            .map(|(domain, bucket)| (domain.to_string(), bucket.len() as u64))
            .collect()
    }

    /// The next non-empty domain that passes `ready`, advancing the
    /// round-robin cursor past it.
    pub fn next_ready(&mut self, ready: impl Fn(&Domain) -> bool) -> Option<Domain> {
        let len = self.order.len();
        for step in 0..len {
            let index = (self.cursor + step) % len;
            let domain = &self.order[index];
            let has_work = self.buckets.get(domain).is_some_and(|b| !b.is_empty());
            if has_work && ready(domain) {
                self.cursor = (index + 1) % len;
                return Some(domain.clone());
            }
        }
        None
    }

    /// Pop up to `n` recipients from one bucket.
    pub fn pop_chunk(&mut self, domain: &Domain, n: usize) -> Vec<String> {
        let Some(bucket) = self.buckets.get_mut(domain) else {
            return Vec::new();
        };
        let take = n.min(bucket.len());
        bucket.drain(..take).collect()
    }

    /// Return a blocked chunk to the head of its bucket, order preserved.
    pub fn requeue_front(&mut self, domain: &Domain, recipients: Vec<String>) {
        if let Some(bucket) = self.buckets.get_mut(domain) {
            for recipient in recipients.into_iter().rev() {
                bucket.push_front(recipient);
            }
        }
    }
}

/// Everything a scheduler run needs.
pub struct Scheduler {
    pub job: Arc<Job>,
    pub recipients: Vec<String>,
    pub config: Arc<ConfigStore>,
    pub pressure: Arc<PressureController>,
    pub gate: Arc<PreflightGate>,
    pub registry: Arc<RecipientRegistry>,
    pub monitor: Option<Arc<MonitorClient>>,
    pub persister: Arc<Persister>,
}

impl Scheduler {
    /// Drive the job to completion, stop, or error.
    pub async fn run(self) {
        let job = self.job.clone();
        info!(job = %job.id, recipients = self.recipients.len(), "scheduler starting");

        let mut buckets = DomainBuckets::partition(&self.recipients);
        let spec = job.spec.clone();
        let chunk_size_hint = spec.chunk_size.max(1);
        job.with_state(|state| {
            state.status = JobStatus::Running;
            state.domain_plan = buckets.plan();
            state.chunks_total = buckets
                .plan()
                .values()
                .map(|count| (*count as usize).div_ceil(chunk_size_hint) as u32)
                .sum();
            state.mark_dirty();
        });
        self.persister.maybe_persist(&job, true).await;

        let mut backoff = ScopedBackoff::new();
        let mut sender_cursors: AHashMap<Domain, usize> = AHashMap::new();
        let mut chunk_index: u32 = 0;

        loop {
            if job.stop_requested() {
                break;
            }
            if job.paused() {
                job.with_state(|state| {
                    if state.status == JobStatus::Running {
                        state.status = JobStatus::Paused;
                    }
                });
                tokio::time::sleep(WAIT_SLICE).await;
                continue;
            }
            job.with_state(|state| {
                if state.status == JobStatus::Paused || state.status == JobStatus::Backoff {
                    state.status = JobStatus::Running;
                }
            });

            if buckets.is_empty() {
                // Buckets drained; pending scoped retries were requeued
                // into the buckets themselves, so empty means done.
                break;
            }

            // Live policy and pressure caps for this iteration.
            let policy = self.config.snapshot();
            let window = job.with_state(|state| state.outcome_window());
            let base = CapSet {
                workers: spec.thread_workers.max(1),
                chunk_size: spec.chunk_size.max(1),
                delay_s: spec.delay_s.max(0.0),
                sleep_chunks: spec.sleep_chunks.max(0.0),
            };
            let pressure = self.pressure.evaluate(&policy, &window, &base).await;
            let caps = pressure.applied;

            // Pick the next receiver domain whose (receiver, sender) pair
            // is not paused.
            let now = Instant::now();
            let chosen = buckets.next_ready(|domain| {
                let attempt = 0; // rotation for readiness uses the current cursor
                let sender =
                    choose_sender(&spec.senders, &sender_cursors, domain, attempt);
                sender
                    .and_then(|s| s.domain())
                    .is_none_or(|sender_domain| !backoff.is_blocked(domain, &sender_domain, now))
            });

            let Some(domain) = chosen else {
                // Every bucket with work is on scoped backoff: sleep until
                // the earliest retry, in slices, staying responsive.
                job.with_state(|state| {
                    if state.status == JobStatus::Running {
                        state.status = JobStatus::Backoff;
                    }
                });
                let wait = backoff
                    .earliest_retry()
                    .map_or(WAIT_SLICE, |at| at.saturating_duration_since(now))
                    .max(Duration::from_millis(50));
                if sliced_wait(&job, wait.min(Duration::from_secs(5))).await {
                    break;
                }
                continue;
            };

            let recipients = buckets.pop_chunk(&domain, caps.chunk_size);
            if recipients.is_empty() {
                continue;
            }

            let sender = match choose_sender(&spec.senders, &sender_cursors, &domain, 0) {
                Some(sender) => sender.clone(),
                None => {
                    job.with_state(|state| {
                        state.status = JobStatus::Error;
                        state.last_error = Some("senders list is empty".to_string());
                    });
                    self.persister.maybe_persist(&job, true).await;
                    return;
                }
            };
            let sender_domain = sender.domain().unwrap_or_else(|| Domain::new("invalid"));
            let attempt = backoff.attempts(&domain, &sender_domain);

            // Rotate sender and variants by (cursor + attempt).
            let cursor = sender_cursors.get(&domain).copied().unwrap_or(0);
            let rotation = cursor + attempt as usize;
            let sender = spec.senders[rotation % spec.senders.len()].clone();
            let sender_domain = sender.domain().unwrap_or_else(|| Domain::new("invalid"));
            let subject = pick_variant(&spec.subjects, rotation);
            let body_template = pick_variant(&spec.bodies, rotation);

            // The rotation may have landed on a pair that is itself paused
            // (possible once several identities blocked in sequence). Never
            // dispatch into a paused pair: put the chunk back and wait.
            if backoff.is_blocked(&domain, &sender_domain, Instant::now()) {
                buckets.requeue_front(&domain, recipients);
                if sliced_wait(&job, WAIT_SLICE).await {
                    break;
                }
                continue;
            }

            // Preflight: content score, blacklist, chunk-scoped MTA policy.
            let mta_policy = self.pressure.chunk_policy(&policy, &domain).await;
            let profile = ChunkProfile {
                receiver_domain: domain.clone(),
                sender_domain: Some(sender_domain.clone()),
                from_email: sender.email.clone(),
                subject: subject.clone(),
                body: body_template.clone(),
                smtp_host: spec.smtp.host.clone(),
                variant_count: spec.variant_count(),
            };
            let gate_config = GateConfig {
                spam_threshold: spec.spam_threshold,
                backoff_enabled: spec.backoff_enabled,
                rbl_bypass: policy.rbl_bypass,
            };
            let preflight = self.gate.check(&profile, &gate_config, mta_policy).await;

            let (mut workers, mut delay_s) = (caps.workers, caps.delay_s);
            match preflight.verdict {
                Verdict::Allow => {}
                Verdict::Slow {
                    delay_floor,
                    worker_cap,
                } => {
                    // This attempt only.
                    workers = workers.min(worker_cap.max(1));
                    delay_s = delay_s.max(delay_floor);
                }
                Verdict::Block { reason } => {
                    let attempts = backoff.register(
                        &domain,
                        &sender_domain,
                        policy.backoff_base_secs,
                        policy.backoff_cap_secs,
                    );
                    let abandoned = attempts > MAX_CHUNK_ATTEMPTS;
                    let size = recipients.len();
                    if abandoned {
                        backoff.clear(&domain, &sender_domain);
                        job.with_state(|state| {
                            state.counters.skipped += size as u64;
                            state.chunks_abandoned += 1;
                            state.push_chunk_state(ChunkState {
                                index: chunk_index,
                                domain: domain.to_string(),
                                size,
                                attempt: attempts,
                                sender: sender.email.clone(),
                                phase: ChunkPhase::Abandoned,
                                score: preflight.score,
                                at: chrono::Utc::now().timestamp(),
                            });
                            state.last_error = Some(reason.clone());
                            state.mark_dirty();
                        });
                        warn!(job = %job.id, domain = %domain, attempts, "chunk abandoned");
                    } else {
                        buckets.requeue_front(&domain, recipients);
                        job.with_state(|state| {
                            state.chunks_backoff += 1;
                            state.push_chunk_state(ChunkState {
                                index: chunk_index,
                                domain: domain.to_string(),
                                size,
                                attempt: attempts,
                                sender: sender.email.clone(),
                                phase: ChunkPhase::Backoff,
                                score: preflight.score,
                                at: chrono::Utc::now().timestamp(),
                            });
                            state.mark_dirty();
                        });
                        debug!(
                            job = %job.id,
                            domain = %domain,
                            attempts,
                            reason,
                            "chunk under scoped backoff"
                        );
                    }
                    chunk_index += 1;
                    self.persister.maybe_persist(&job, false).await;
                    continue;
                }
            }

            // Dispatch.
            let size = recipients.len();
            job.with_state(|state| {
                state.push_chunk_state(ChunkState {
                    index: chunk_index,
                    domain: domain.to_string(),
                    size,
                    attempt,
                    sender: sender.email.clone(),
                    phase: ChunkPhase::Running,
                    score: preflight.score,
                    at: chrono::Utc::now().timestamp(),
                });
            });

            let assignment = ChunkAssignment {
                index: chunk_index,
                domain: domain.clone(),
                recipients,
                sender: sender.clone(),
                subject,
                body_template,
                attempt,
            };
            let report = SenderPool::send_chunk(
                &job,
                &self.registry,
                self.monitor.clone(),
                assignment,
                workers,
                delay_s,
            )
            .await;

            backoff.clear(&domain, &sender_domain);
            *sender_cursors.entry(domain.clone()).or_insert(0) += 1;
            job.with_state(|state| {
                state.chunks_done += 1;
                state.push_chunk_state(ChunkState {
                    index: chunk_index,
                    domain: domain.to_string(),
                    size,
                    attempt,
                    sender: sender.email.clone(),
                    phase: if attempt > 0 {
                        ChunkPhase::DoneAfterBackoff
                    } else {
                        ChunkPhase::Done
                    },
                    score: preflight.score,
                    at: chrono::Utc::now().timestamp(),
                });
                state.mark_dirty();
            });
            chunk_index += 1;
            self.persister.maybe_persist(&job, false).await;

            if report.stopped {
                break;
            }
            if caps.sleep_chunks > 0.0
                && sliced_wait(&job, Duration::from_secs_f64(caps.sleep_chunks)).await
            {
                break;
            }
        }

        // Terminal bookkeeping.
        job.with_state(|state| {
            if state.stop_requested {
                state.status = JobStatus::Stopped;
                if state.stop_reason.is_none() {
                    state.stop_reason = Some("stopped".to_string());
                }
            } else if state.status != JobStatus::Error {
                state.status = JobStatus::Done;
            }
            state.mark_dirty();
        });
        self.persister.maybe_persist(&job, true).await;
        info!(job = %job.id, status = job.status().as_str(), "scheduler finished");
    }
}

fn choose_sender<'a>(
    senders: &'a [herald_common::SenderIdentity],
    cursors: &AHashMap<Domain, usize>,
    domain: &Domain,
    attempt: u32,
) -> Option<&'a herald_common::SenderIdentity> {
    if senders.is_empty() {
        return None;
    }
    let cursor = cursors.get(domain).copied().unwrap_or(0);
    Some(&senders[(cursor + attempt as usize) % senders.len()])
}

fn pick_variant(variants: &[String], rotation: usize) -> String {
    if variants.is_empty() {
        String::new()
    } else {
        variants[rotation % variants.len()].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipients(addresses: &[&str]) -> Vec<String> {
        addresses.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_partition_preserves_first_seen_order() {
        let buckets = DomainBuckets::partition(&recipients(&[
            "a1@gmail.com",
            "b1@yahoo.com",
            "a2@gmail.com",
            "c1@outlook.com",
        ]));
        assert_eq!(buckets.remaining(), 4);
        assert_eq!(
            buckets.order,
            vec![
                Domain::new("gmail.com"),
                Domain::new("yahoo.com"),
                Domain::new("outlook.com")
            ]
        );
    }

    #[test]
    fn test_round_robin_rotates_domains() {
        let mut buckets = DomainBuckets::partition(&recipients(&[
            "a1@gmail.com",
            "a2@gmail.com",
            "b1@yahoo.com",
            "b2@yahoo.com",
        ]));

        let first = buckets.next_ready(|_| true).unwrap();
        let second = buckets.next_ready(|_| true).unwrap();
        assert_ne!(first, second);
        let third = buckets.next_ready(|_| true).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_next_ready_skips_blocked_domains() {
        let mut buckets = DomainBuckets::partition(&recipients(&[
            "a1@gmail.com",
            "b1@yahoo.com",
        ]));
        let gmail = Domain::new("gmail.com");
        let chosen = buckets.next_ready(|domain| *domain != gmail).unwrap();
        assert_eq!(chosen, Domain::new("yahoo.com"));

        // All blocked: nothing ready.
        assert_eq!(buckets.next_ready(|_| false), None);
    }

    #[test]
    fn test_pop_and_requeue_preserve_order() {
        let mut buckets = DomainBuckets::partition(&recipients(&[
            "a1@gmail.com",
            "a2@gmail.com",
            "a3@gmail.com",
        ]));
        let gmail = Domain::new("gmail.com");
        let chunk = buckets.pop_chunk(&gmail, 2);
        assert_eq!(chunk, recipients(&["a1@gmail.com", "a2@gmail.com"]));

        buckets.requeue_front(&gmail, chunk);
        let again = buckets.pop_chunk(&gmail, 3);
        assert_eq!(
            again,
            recipients(&["a1@gmail.com", "a2@gmail.com", "a3@gmail.com"])
        );
    }

    #[test]
    fn test_scoped_backoff_is_per_pair() {
        let mut backoff = ScopedBackoff::new();
        let gmail = Domain::new("gmail.com");
        let yahoo = Domain::new("yahoo.com");
        let sender = Domain::new("sender.example");

        backoff.register(&gmail, &sender, 30.0, 900.0);
        let now = Instant::now();
        assert!(backoff.is_blocked(&gmail, &sender, now));
        assert!(!backoff.is_blocked(&yahoo, &sender, now));
        assert_eq!(backoff.attempts(&gmail, &sender), 1);
        assert_eq!(backoff.attempts(&yahoo, &sender), 0);

        backoff.clear(&gmail, &sender);
        assert!(!backoff.is_blocked(&gmail, &sender, Instant::now()));
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let mut backoff = ScopedBackoff::new();
        let receiver = Domain::new("gmail.com");
        let sender = Domain::new("sender.example");

        // Attempts escalate; the retry instant stays within the cap.
        for expected in 1..=8 {
            let attempts = backoff.register(&receiver, &sender, 1.0, 4.0);
            assert_eq!(attempts, expected);
            let until = backoff.earliest_retry().unwrap();
            assert!(until.saturating_duration_since(Instant::now()) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_choose_sender_rotation() {
        let senders = vec![
            herald_common::SenderIdentity::new("", "s0@a.example"),
            herald_common::SenderIdentity::new("", "s1@b.example"),
            herald_common::SenderIdentity::new("", "s2@c.example"),
        ];
        let mut cursors = AHashMap::new();
        let domain = Domain::new("gmail.com");

        let chosen = choose_sender(&senders, &cursors, &domain, 0).unwrap();
        assert_eq!(chosen.email, "s0@a.example");

        cursors.insert(domain.clone(), 2);
        let chosen = choose_sender(&senders, &cursors, &domain, 0).unwrap();
        assert_eq!(chosen.email, "s2@c.example");

        // Attempt shifts the rotation.
        let chosen = choose_sender(&senders, &cursors, &domain, 2).unwrap();
        assert_eq!(chosen.email, "s1@b.example");
    }
}
