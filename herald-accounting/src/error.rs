//! Error types for the accounting feed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcctError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("bridge error: {0}")]
    Bridge(String),
}

pub type Result<T> = std::result::Result<T, AcctError>;
