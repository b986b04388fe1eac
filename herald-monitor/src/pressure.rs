//! Adaptive pressure policy.
//!
//! Derives caps on workers, chunk size, per-message delay and inter-chunk
//! sleep from two signal families: live MTA totals (queue, spool, deferrals)
//! and the job's own recent outcome ratios. The worst of the two wins. A
//! separate chunk-scoped check consults the per-domain queue detail and can
//! block or slow a single receiver domain without touching the rest.

use std::sync::Arc;

use herald_common::{Domain, PolicySnapshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::client::MonitorClient;
use crate::error::MonitorError;

/// Rolling view over a job's recent results, computed by the caller from its
/// bounded recent-results ring (roughly the last 140 entries).
#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeWindow {
    /// Total reconciled outcomes in the window.
    pub total: usize,
    pub bounced: usize,
    pub complained: usize,
    pub deferred: usize,
    /// Recent SMTP failures, by class.
    pub failures: usize,
    pub fourxx: usize,
    pub fivexx: usize,
}

impl OutcomeWindow {
    /// Weighted badness: bounces and complaints count full, deferrals 0.6.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn bad_ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let bad = self.bounced as f64 + self.complained as f64 + 0.6 * self.deferred as f64;
        bad / self.total as f64
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fourxx_ratio(&self) -> f64 {
        if self.failures == 0 {
            0.0
        } else {
            self.fourxx as f64 / self.failures as f64
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fivexx_ratio(&self) -> f64 {
        if self.failures == 0 {
            0.0
        } else {
            self.fivexx as f64 / self.failures as f64
        }
    }
}

/// The four throttles the scheduler applies. `workers` and `chunk_size` are
/// capped downward; `delay_s` and `sleep_chunks` are floored upward.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapSet {
    pub workers: usize,
    pub chunk_size: usize,
    pub delay_s: f64,
    pub sleep_chunks: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureAction {
    Steady,
    SoftSlowdown,
    Slowdown,
    HardSlowdown,
    SpeedUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressurePolicy {
    /// 0 = clear, 3 = hard pressure.
    pub level: u8,
    pub action: PressureAction,
    pub applied: CapSet,
    pub reason: String,
}

/// Chunk-scoped verdict from the MTA's per-domain detail.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPolicy {
    Ok,
    Slow { delay_floor: f64, worker_cap: usize },
    Block { reason: String },
}

#[derive(Debug, Clone)]
pub struct PressureController {
    monitor: Option<Arc<MonitorClient>>,
}

impl PressureController {
    #[must_use]
    pub const fn new(monitor: Option<Arc<MonitorClient>>) -> Self {
        Self { monitor }
    }

    /// Compute the policy for the next chunk dispatch.
    pub async fn evaluate(
        &self,
        policy: &PolicySnapshot,
        window: &OutcomeWindow,
        base: &CapSet,
    ) -> PressurePolicy {
        let (monitor_level, monitor_reason) = self.monitor_level(policy).await;
        let (outcome_level, outcome_reason) = outcome_level(window);
        let level = monitor_level.max(outcome_level);

        let mut applied = *base;
        let action = match level {
            0 => {
                if speed_up_allowed(window) {
                    applied.workers = base.workers.saturating_add(1);
                    #[allow(
                        clippy::cast_precision_loss,
                        clippy::cast_possible_truncation,
                        clippy::cast_sign_loss
                    )]
                    {
                        applied.chunk_size = ((base.chunk_size as f64) * 1.2).round() as usize;
                    }
                    applied.delay_s = base.delay_s * 0.7;
                    PressureAction::SpeedUp
                } else {
                    PressureAction::Steady
                }
            }
            1 => {
                applied.workers = applied.workers.min(8);
                applied.delay_s = applied.delay_s.max(0.05);
                applied.chunk_size = applied.chunk_size.min(220);
                PressureAction::SoftSlowdown
            }
            2 => {
                applied.workers = applied.workers.min(4);
                applied.delay_s = applied.delay_s.max(0.20);
                applied.sleep_chunks = applied.sleep_chunks.max(0.3);
                applied.chunk_size = applied.chunk_size.min(120);
                PressureAction::Slowdown
            }
            _ => {
                applied.workers = applied.workers.min(2);
                applied.delay_s = applied.delay_s.max(0.6);
                applied.sleep_chunks = applied.sleep_chunks.max(1.0);
                applied.chunk_size = applied.chunk_size.min(60);
                PressureAction::HardSlowdown
            }
        };

        applied.workers = applied.workers.max(1);
        applied.chunk_size = applied.chunk_size.max(1);

        let reason = match (monitor_level >= outcome_level, monitor_reason, outcome_reason) {
            (true, Some(reason), _) | (false, _, Some(reason)) => reason,
            (_, Some(reason), None) | (_, None, Some(reason)) => reason,
            (_, None, None) => "clear".to_string(),
        };

        debug!(level, ?action, %reason, "pressure evaluated");
        PressurePolicy {
            level,
            action,
            applied,
            reason,
        }
    }

    /// Per-domain verdict for one chunk, from `/domainDetail` and
    /// `/queueDetail`. Monitor absence is ok unless strict mode is on.
    pub async fn chunk_policy(&self, policy: &PolicySnapshot, domain: &Domain) -> ChunkPolicy {
        let Some(monitor) = &self.monitor else {
            return absent_policy(policy, "monitor not configured");
        };
        if !monitor.is_configured() {
            return absent_policy(policy, "monitor not configured");
        }

        let domain_detail = monitor.domain_detail(domain).await;
        let queue_detail = monitor.queue_detail(&format!("{domain}/*")).await;

        let mut worst_deferred = 0;
        let mut worst_errors = 0;
        let mut reachable = false;
        for detail in [&domain_detail, &queue_detail] {
            match detail {
                Ok(detail) => {
                    reachable = true;
                    worst_deferred = worst_deferred.max(detail.deferred);
                    worst_errors = worst_errors.max(detail.errors);
                }
                Err(MonitorError::NotConfigured) => {}
                Err(e) => warn!(domain = %domain, error = %e, "monitor detail fetch failed"),
            }
        }
        if !reachable {
            return absent_policy(policy, "monitor unreachable");
        }

        if worst_deferred >= policy.domain_deferred_block || worst_errors >= policy.domain_errors_block
        {
            return ChunkPolicy::Block {
                reason: format!(
                    "domain {domain} under pressure: deferred={worst_deferred} errors={worst_errors}"
                ),
            };
        }
        if worst_deferred >= policy.domain_deferred_slow || worst_errors >= policy.domain_errors_slow {
            return ChunkPolicy::Slow {
                delay_floor: 0.2,
                worker_cap: 4,
            };
        }
        ChunkPolicy::Ok
    }

    async fn monitor_level(&self, policy: &PolicySnapshot) -> (u8, Option<String>) {
        let Some(monitor) = &self.monitor else {
            return (0, None);
        };
        if !monitor.is_configured() {
            return (0, None);
        }

        let status = match monitor.status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "monitor status fetch failed");
                return (0, None);
            }
        };

        let mut level = 0;
        let mut reason = None;
        let mut raise = |value: Option<i64>, thresholds: &[i64; 3], what: &str| {
            let Some(value) = value else { return };
            let candidate = thresholds
                .iter()
                .filter(|threshold| value >= **threshold)
                .count() as u8;
            if candidate > level {
                level = candidate;
                reason = Some(format!("{what}={value}"));
            }
        };

        raise(status.queued_recipients, &policy.queued_thresholds, "queued");
        raise(status.spool_recipients, &policy.spool_thresholds, "spool");
        raise(status.deferred_total, &policy.deferred_thresholds, "deferred");

        (level, reason)
    }
}

fn absent_policy(policy: &PolicySnapshot, why: &str) -> ChunkPolicy {
    if policy.monitor_strict {
        ChunkPolicy::Block {
            reason: why.to_string(),
        }
    } else {
        ChunkPolicy::Ok
    }
}

fn outcome_level(window: &OutcomeWindow) -> (u8, Option<String>) {
    let bad = window.bad_ratio();
    let fourxx = window.fourxx_ratio();
    let fivexx = window.fivexx_ratio();

    if window.complained >= 3 || bad >= 0.35 || fivexx >= 0.20 {
        return (
            3,
            Some(format!(
                "outcomes critical: bad={bad:.2} 5xx={fivexx:.2} complaints={}",
                window.complained
            )),
        );
    }
    if bad >= 0.20 || fivexx >= 0.10 || fourxx >= 0.30 {
        return (
            2,
            Some(format!("outcomes degraded: bad={bad:.2} 4xx={fourxx:.2} 5xx={fivexx:.2}")),
        );
    }
    if bad >= 0.10 || fourxx >= 0.12 {
        return (1, Some(format!("outcomes soft: bad={bad:.2} 4xx={fourxx:.2}")));
    }
    (0, None)
}

/// Speed-ups require a meaningful sample and a clean window.
fn speed_up_allowed(window: &OutcomeWindow) -> bool {
    window.total >= 80 && window.bad_ratio() <= 0.03 && window.fivexx == 0
}
