//! MTA monitor consumption and the adaptive pressure policy.
//!
//! The monitor client speaks to the MTA's HTTP status endpoints and is
//! deliberately tolerant of version drift in the payloads. The pressure
//! controller folds those live signals together with recent delivery
//! outcomes into concrete caps on concurrency and pacing.

pub mod client;
pub mod error;
pub mod pressure;

pub use client::{DomainDetail, DomainQueue, MonitorClient, MonitorConfig, MtaStatus, QueueEntry};
pub use error::{MonitorError, Result};
pub use pressure::{
    CapSet, ChunkPolicy, OutcomeWindow, PressureAction, PressureController, PressurePolicy,
};
