//! Error types for monitor access.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("monitor unavailable: {0}")]
    Unavailable(String),

    #[error("monitor is not configured")]
    NotConfigured,
}

pub type Result<T> = std::result::Result<T, MonitorError>;
