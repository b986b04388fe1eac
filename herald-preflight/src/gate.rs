//! The preflight gate.

use std::sync::Arc;

use herald_common::Domain;
use herald_monitor::ChunkPolicy;
use tracing::{info, warn};

use crate::{
    dnsbl::{BlacklistSurvey, DnsblClient},
    score::{ContentScore, ContentScorer},
};

/// Scores inside this band above the threshold are advisory for
/// multi-variant jobs: the rotation will try a different rendering anyway.
const NEAR_THRESHOLD_BAND: f64 = 0.5;

/// What the gate needs to know about one chunk attempt.
#[derive(Debug, Clone)]
pub struct ChunkProfile {
    pub receiver_domain: Domain,
    pub sender_domain: Option<Domain>,
    pub from_email: String,
    pub subject: String,
    pub body: String,
    pub smtp_host: String,
    /// Number of distinct (subject, body) renderings the campaign rotates
    /// through. Governs the near-threshold asymmetry.
    pub variant_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub spam_threshold: f64,
    /// When off, preflight never blocks; findings are informational.
    pub backoff_enabled: bool,
    /// When on (the default), RBL listings of the injection host are
    /// informational instead of blocking.
    pub rbl_bypass: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    /// Reduce workers and raise per-message delay for this attempt only.
    Slow { delay_floor: f64, worker_cap: usize },
    /// Requeue the chunk under scoped backoff.
    Block { reason: String },
}

/// The gate's full answer, kept on the chunk for the state log.
#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub verdict: Verdict,
    pub score: Option<f64>,
    pub score_report: String,
    pub blacklist: BlacklistSurvey,
}

pub struct PreflightGate {
    scorer: Arc<dyn ContentScorer>,
    dnsbl: Arc<DnsblClient>,
}

impl std::fmt::Debug for PreflightGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreflightGate").finish_non_exhaustive()
    }
}

impl PreflightGate {
    #[must_use]
    pub fn new(scorer: Arc<dyn ContentScorer>, dnsbl: Arc<DnsblClient>) -> Self {
        Self { scorer, dnsbl }
    }

    /// Evaluate one chunk attempt. `mta_policy` is the pressure
    /// controller's chunk-scoped verdict, computed by the caller.
    pub async fn check(
        &self,
        profile: &ChunkProfile,
        config: &GateConfig,
        mta_policy: ChunkPolicy,
    ) -> PreflightReport {
        let score = match self
            .scorer
            .score(&profile.subject, &profile.body, &profile.from_email)
            .await
        {
            Ok(score) => score,
            Err(e) => {
                warn!(error = %e, "content scorer unavailable, continuing without a score");
                ContentScore {
                    score: None,
                    report: format!("scorer unavailable: {e}"),
                }
            }
        };

        let blacklist = self
            .dnsbl
            .survey(&profile.smtp_host, profile.sender_domain.as_ref())
            .await;

        let verdict = decide(profile, config, &score, &blacklist, mta_policy);
        if let Verdict::Block { reason } = &verdict {
            info!(
                domain = %profile.receiver_domain,
                reason,
                "preflight blocked chunk"
            );
        }

        PreflightReport {
            verdict,
            score: score.score,
            score_report: score.report,
            blacklist,
        }
    }
}

fn decide(
    profile: &ChunkProfile,
    config: &GateConfig,
    score: &ContentScore,
    blacklist: &BlacklistSurvey,
    mta_policy: ChunkPolicy,
) -> Verdict {
    if !blacklist.domain_listed.is_empty() {
        // Domain listings are informational by default.
        info!(
            sender = profile.sender_domain.as_ref().map_or("", |d| d.as_str()),
            listing = %blacklist.summary(),
            "sender domain appears on a DBL"
        );
    }

    if config.backoff_enabled {
        if let Some(value) = score.score {
            if score_blocks(value, config.spam_threshold, profile.variant_count) {
                return Verdict::Block {
                    reason: format!(
                        "content score {value:.1} over threshold {:.1}",
                        config.spam_threshold
                    ),
                };
            }
        }

        if blacklist.ip_blocked() && !config.rbl_bypass {
            return Verdict::Block {
                reason: format!("injection host blacklisted: {}", blacklist.summary()),
            };
        }

        if let ChunkPolicy::Block { reason } = mta_policy {
            return Verdict::Block { reason };
        }
    }

    if let ChunkPolicy::Slow {
        delay_floor,
        worker_cap,
    } = mta_policy
    {
        return Verdict::Slow {
            delay_floor,
            worker_cap,
        };
    }

    Verdict::Allow
}

/// Single-variant jobs hard-block at the threshold. Multi-variant jobs get
/// an advisory band above it before blocking, because the next attempt
/// rotates to a different rendering.
fn score_blocks(score: f64, threshold: f64, variant_count: usize) -> bool {
    if variant_count > 1 {
        if score > threshold && score <= threshold + NEAR_THRESHOLD_BAND {
            warn!(
                score,
                threshold, "content score near threshold, advisory for rotated variants"
            );
            return false;
        }
        score > threshold + NEAR_THRESHOLD_BAND
    } else {
        score >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(variants: usize) -> ChunkProfile {
        ChunkProfile {
            receiver_domain: Domain::new("example.com"),
            sender_domain: Some(Domain::new("sender.example")),
            from_email: "news@sender.example".to_string(),
            subject: "Hello".to_string(),
            body: "Body".to_string(),
            smtp_host: "127.0.0.1".to_string(),
            variant_count: variants,
        }
    }

    fn config(backoff: bool, rbl_bypass: bool) -> GateConfig {
        GateConfig {
            spam_threshold: 5.0,
            backoff_enabled: backoff,
            rbl_bypass,
        }
    }

    #[test]
    fn test_single_variant_blocks_at_threshold() {
        assert!(score_blocks(5.0, 5.0, 1));
        assert!(!score_blocks(4.9, 5.0, 1));
    }

    #[test]
    fn test_multi_variant_near_threshold_is_advisory() {
        assert!(!score_blocks(5.0, 5.0, 3));
        assert!(!score_blocks(5.4, 5.0, 3));
        assert!(score_blocks(5.6, 5.0, 3));
    }

    #[test]
    fn test_decide_respects_backoff_flag() {
        let score = ContentScore {
            score: Some(9.0),
            report: String::new(),
        };
        let clean = BlacklistSurvey::default();

        let blocked = decide(
            &profile(1),
            &config(true, true),
            &score,
            &clean,
            ChunkPolicy::Ok,
        );
        assert!(matches!(blocked, Verdict::Block { .. }));

        // With backoff disabled the same score passes.
        let allowed = decide(
            &profile(1),
            &config(false, true),
            &score,
            &clean,
            ChunkPolicy::Ok,
        );
        assert_eq!(allowed, Verdict::Allow);
    }

    #[test]
    fn test_decide_rbl_bypass() {
        let score = ContentScore::default();
        let mut listed = BlacklistSurvey::default();
        listed.ip_listed.push((
            std::net::Ipv4Addr::new(192, 0, 2, 1),
            "zen.spamhaus.org".to_string(),
        ));

        // Bypass on (default): listing is informational.
        let allowed = decide(
            &profile(1),
            &config(true, true),
            &score,
            &listed,
            ChunkPolicy::Ok,
        );
        assert_eq!(allowed, Verdict::Allow);

        // Bypass off: listing blocks.
        let blocked = decide(
            &profile(1),
            &config(true, false),
            &score,
            &listed,
            ChunkPolicy::Ok,
        );
        assert!(matches!(blocked, Verdict::Block { .. }));
    }

    #[test]
    fn test_decide_mta_policy_passthrough() {
        let score = ContentScore::default();
        let clean = BlacklistSurvey::default();

        let slow = decide(
            &profile(1),
            &config(true, true),
            &score,
            &clean,
            ChunkPolicy::Slow {
                delay_floor: 0.2,
                worker_cap: 4,
            },
        );
        assert_eq!(
            slow,
            Verdict::Slow {
                delay_floor: 0.2,
                worker_cap: 4
            }
        );

        let blocked = decide(
            &profile(1),
            &config(true, true),
            &score,
            &clean,
            ChunkPolicy::Block {
                reason: "pressure".to_string(),
            },
        );
        assert!(matches!(blocked, Verdict::Block { .. }));
    }
}
