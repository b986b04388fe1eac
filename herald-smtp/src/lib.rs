//! SMTP submission client for campaign injection.
//!
//! Speaks plain, STARTTLS and implicit-TLS submission with optional AUTH.
//! One client instance owns one connection; the sender pool gives each
//! worker its own.

pub mod client;
pub mod error;
pub mod message;
pub mod response;

pub use client::{SecurityMode, SmtpClient};
pub use error::{ClientError, Result};
pub use message::{BodyFormat, CampaignMessage};
pub use response::Reply;
