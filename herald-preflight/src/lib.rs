//! Per-chunk preflight: content scoring, blacklist survey, MTA policy.
//!
//! Every chunk attempt passes through the gate before the sender pool sees
//! it. The gate combines a pluggable content score, a DNSBL survey of the
//! injection host and sender domain, and the pressure controller's
//! chunk-scoped MTA verdict.

pub mod dnsbl;
pub mod gate;
pub mod score;

pub use dnsbl::{BlacklistSurvey, DnsblClient};
pub use gate::{ChunkProfile, GateConfig, PreflightGate, PreflightReport, Verdict};
pub use score::{CommandScorer, ContentScore, ContentScorer, DisabledScorer, ScoreError, SpamdScorer};
