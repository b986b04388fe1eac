//! Accounting feed: parsing, tailing, and the HTTP bridge client.
//!
//! The MTA writes append-only accounting files (CSV or JSON lines). This
//! crate turns those into normalized [`AccountingEvent`]s, either by tailing
//! the files directly with durable cursors, or by pulling from a bridge
//! process that exposes the same semantics over HTTP.

pub mod bridge;
pub mod cursor;
pub mod error;
pub mod event;
pub mod parser;
pub mod tailer;

pub use bridge::{normalize_bridge_host, BridgeClient, BridgePull, PullScope};
pub use cursor::Cursor;
pub use error::{AcctError, Result};
pub use event::{AccountingEvent, OutcomeKind};
pub use parser::LineParser;
pub use tailer::{Pull, PullStats, Tailer, TailerConfig};
