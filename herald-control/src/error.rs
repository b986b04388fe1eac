//! Control transport failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Socket-level failure.
    #[error("control socket I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A frame header or size violated the framing rules.
    #[error("malformed control frame: {0}")]
    Frame(String),

    /// A frame body failed to encode or decode.
    #[error("control codec: {0}")]
    Codec(String),

    /// The peer hung up between frames.
    #[error("peer disconnected")]
    Disconnected,

    /// The exchange overran its deadline.
    #[error("control request deadline exceeded")]
    Deadline,
}

impl From<bincode::error::EncodeError> for ControlError {
    fn from(error: bincode::error::EncodeError) -> Self {
        Self::Codec(error.to_string())
    }
}

impl From<bincode::error::DecodeError> for ControlError {
    fn from(error: bincode::error::DecodeError) -> Self {
        Self::Codec(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
