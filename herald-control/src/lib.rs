//! Operator control surface over a Unix domain socket.
//!
//! Length-prefixed bincode frames carrying versioned requests and
//! responses. The daemon runs the server; `heraldctl` and the admin
//! tooling use the client.

pub mod client;
pub mod error;
mod frame;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use protocol::{
    Command, ConfigCommand, ConfigValue, Fault, FaultCode, JobCommand, Request, Response,
    ResponseData, ResponsePayload, SystemCommand, PROTOCOL_VERSION,
};
pub use server::{CommandHandler, ControlServer};
