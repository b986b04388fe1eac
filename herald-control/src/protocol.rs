//! Control protocol types and serialization.

use herald_common::ConfigSource;
use herald_engine::{JobSpec, JobStatusView};
use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request sent to the control server (versioned wrapper).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    pub command: Command,
}

impl Request {
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
        }
    }
}

/// Request command types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Job(JobCommand),
    Config(ConfigCommand),
    System(SystemCommand),
}

/// Job lifecycle commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobCommand {
    /// Submit a new job.
    Start(Box<JobSpec>),
    /// Pause dispatch at the next checkpoint.
    Pause { job_id: String },
    /// Clear a pause.
    Resume { job_id: String },
    /// Cooperative stop with a reason.
    Stop { job_id: String, reason: String },
    /// Force-stop if needed and remove all state.
    Delete { job_id: String },
    /// Status with bounded history.
    Status {
        job_id: String,
        history_limit: usize,
    },
    /// Summaries of every known job.
    List,
}

/// Configuration commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

/// System commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemCommand {
    Ping,
    Status,
}

/// Response from the control server (versioned wrapper).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub version: u32,
    pub payload: ResponsePayload,
}

impl Response {
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Ok,
        }
    }

    #[must_use]
    pub fn data(data: ResponseData) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Data(Box::new(data)),
        }
    }

    #[must_use]
    pub fn fault(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Error(Fault {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Response payload types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    Ok,
    Data(Box<ResponseData>),
    Error(Fault),
}

/// Typed failure, the analogue of an HTTP status on this surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: FaultCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    /// Validation failure (400).
    BadRequest,
    /// An active job already exists for the campaign (409).
    Conflict,
    /// Unknown job or key (404).
    NotFound,
    /// The MTA monitor is required and unreachable (503).
    Unavailable,
    /// Anything else.
    Internal,
}

/// Response data types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    JobStarted { job_id: String },
    JobStatus(Box<JobStatusView>),
    JobList(Vec<JobStatusView>),
    ConfigValue(ConfigValue),
    ConfigList(Vec<ConfigValue>),
    SystemStatus(SystemStatus),
    Message(String),
}

/// One effective configuration value and where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigValue {
    pub key: String,
    pub value: String,
    pub source: String,
    pub restart_required: bool,
}

impl ConfigValue {
    #[must_use]
    pub fn new(key: &str, value: String, source: ConfigSource, restart_required: bool) -> Self {
        Self {
            key: key.to_string(),
            value,
            source: source.as_str().to_string(),
            restart_required,
        }
    }
}

/// Daemon-level status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub jobs_total: usize,
    pub jobs_active: usize,
    /// Whether the MTA monitor answered its last probe.
    pub monitor_ok: bool,
}

impl Command {
    #[must_use]
    pub fn start_job(spec: JobSpec) -> Self {
        Self::Job(JobCommand::Start(Box::new(spec)))
    }
}
