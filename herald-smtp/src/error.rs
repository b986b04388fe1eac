//! Submission client failures.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Socket-level failure: connect, read or write.
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// The server hung up mid-conversation.
    #[error("server disconnected")]
    Disconnected,

    /// A command drew a negative completion reply. The code travels with
    /// the error so callers can split 4xx from 5xx without re-parsing.
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The reply stream violated the protocol grammar.
    #[error("unparseable reply: {0}")]
    BadReply(String),

    /// Every AUTH mechanism the client offers was refused.
    #[error("authentication refused: {0}")]
    AuthFailed(String),

    /// Certificate store, handshake or upgrade trouble.
    #[error("TLS: {0}")]
    Tls(String),

    /// A step overran its deadline.
    #[error("deadline exceeded during {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
