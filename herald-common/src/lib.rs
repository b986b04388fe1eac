pub mod address;
pub mod config;
pub mod domain;
pub mod logging;

pub use address::SenderIdentity;
pub use config::{ConfigError, ConfigSource, ConfigStore, PolicySnapshot};
pub use domain::Domain;
pub use tracing;

/// Process-wide lifecycle signal, broadcast to every long-running task.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
