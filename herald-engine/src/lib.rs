//! The send engine: jobs, scheduling, the sender pool, and reconciliation.
//!
//! A job is one submission run over a recipient list. The controller owns
//! job lifecycles; each running job drives one scheduler loop which pulls
//! receiver-domain chunks through preflight and hands them to a bounded
//! worker pool. Independently, the accounting poller streams normalized
//! events into the reconciler, which settles per-recipient outcomes.

pub mod controller;
pub mod ids;
pub mod job;
pub mod outcome;
pub mod persist;
pub mod poller;
pub mod reconcile;
pub mod registry;
pub mod render;
pub mod scheduler;
pub mod sender;
pub mod spec;

pub use controller::{JobController, OpError, StartError};
pub use job::{Job, JobStatus, JobStatusView};
pub use outcome::{OutcomeStatus, OutcomeStore};
pub use poller::{AccountingPoller, FeedSource};
pub use reconcile::{JobTable, ReconcileOutcome, Reconciler};
pub use registry::RecipientRegistry;
pub use spec::{JobSpec, SmtpSettings, ValidationError};
