//! Durable state for the control plane.
//!
//! A small file-backed table store: one directory per table, one bincode
//! blob per key, written atomically (temp file + rename) under a single
//! writer lock. Writes are upserts, which doubles as the fallback for
//! deployments without a native upsert primitive.
//!
//! This intentionally trades query power for zero external dependencies at
//! runtime: every table we need is a key → blob mapping (job snapshots,
//! per-job outcome sets, per-job registry sets, bridge offsets, config
//! overrides).

pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{Store, Table};
