//! Dispatch of control commands onto the engine.
//!
//! Faults mirror the operator contract: validation failures are
//! `BadRequest`, a duplicate campaign start is `Conflict`, a required but
//! unreachable monitor is `Unavailable`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use herald_common::ConfigStore;
use herald_control::{
    Command, CommandHandler, ConfigCommand, FaultCode, JobCommand, Request, Response,
    ResponseData, SystemCommand,
};
use herald_engine::{controller::StartError, JobController, OpError};
use herald_monitor::MonitorClient;
use tracing::info;

pub struct Handler {
    controller: Arc<JobController>,
    config: Arc<ConfigStore>,
    monitor: Option<Arc<MonitorClient>>,
    started_at: Instant,
}

impl Handler {
    #[must_use]
    pub fn new(
        controller: Arc<JobController>,
        config: Arc<ConfigStore>,
        monitor: Option<Arc<MonitorClient>>,
    ) -> Self {
        Self {
            controller,
            config,
            monitor,
            started_at: Instant::now(),
        }
    }

    async fn handle_job(&self, command: JobCommand) -> Response {
        match command {
            JobCommand::Start(spec) => match self.controller.start(*spec).await {
                Ok(job_id) => Response::data(ResponseData::JobStarted { job_id }),
                Err(StartError::Validation(message)) => {
                    Response::fault(FaultCode::BadRequest, message)
                }
                Err(e @ StartError::Conflict(_)) => {
                    Response::fault(FaultCode::Conflict, e.to_string())
                }
                Err(e @ StartError::MonitorBusy(_)) => {
                    Response::fault(FaultCode::Unavailable, e.to_string())
                }
            },
            JobCommand::Pause { job_id } => op_response(self.controller.pause(&job_id).await),
            JobCommand::Resume { job_id } => op_response(self.controller.resume(&job_id).await),
            JobCommand::Stop { job_id, reason } => {
                op_response(self.controller.stop(&job_id, &reason).await)
            }
            JobCommand::Delete { job_id } => op_response(self.controller.delete(&job_id).await),
            JobCommand::Status {
                job_id,
                history_limit,
            } => match self.controller.status(&job_id, history_limit.clamp(1, 500)) {
                Ok(view) => Response::data(ResponseData::JobStatus(Box::new(view))),
                Err(e) => fault_for(&e),
            },
            JobCommand::List => Response::data(ResponseData::JobList(self.controller.list())),
        }
    }

    fn handle_config(&self, command: ConfigCommand) -> Response {
        use herald_control::ConfigValue;

        match command {
            ConfigCommand::Get { key } => match self.config.get(&key) {
                Ok((value, source)) => Response::data(ResponseData::ConfigValue(
                    ConfigValue::new(&key, value, source, restart_required(&key)),
                )),
                Err(e) => Response::fault(FaultCode::NotFound, e.to_string()),
            },
            ConfigCommand::Set { key, value } => match self.config.set(&key, &value) {
                Ok(applied) => {
                    info!(key, hot = applied.hot_reloaded, "configuration written");
                    Response::ok()
                }
                Err(e @ herald_common::ConfigError::UnknownKey(_)) => {
                    Response::fault(FaultCode::NotFound, e.to_string())
                }
                Err(e) => Response::fault(FaultCode::BadRequest, e.to_string()),
            },
            ConfigCommand::List => {
                let values = ConfigStore::schema()
                    .iter()
                    .filter_map(|spec| {
                        self.config.get(spec.name).ok().map(|(value, source)| {
                            ConfigValue::new(spec.name, value, source, spec.restart_required)
                        })
                    })
                    .collect();
                Response::data(ResponseData::ConfigList(values))
            }
        }
    }

    async fn handle_system(&self, command: SystemCommand) -> Response {
        match command {
            SystemCommand::Ping => Response::data(ResponseData::Message("pong".to_string())),
            SystemCommand::Status => {
                let jobs = self.controller.list();
                let active = jobs.iter().filter(|view| view.status.is_active()).count();
                let monitor_ok = match &self.monitor {
                    Some(monitor) if monitor.is_configured() => monitor.status().await.is_ok(),
                    _ => false,
                };
                let status = herald_control::protocol::SystemStatus {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    jobs_total: jobs.len(),
                    jobs_active: active,
                    monitor_ok,
                };
                Response::data(ResponseData::SystemStatus(status))
            }
        }
    }
}

fn op_response(result: Result<(), OpError>) -> Response {
    match result {
        Ok(()) => Response::ok(),
        Err(e) => fault_for(&e),
    }
}

fn fault_for(error: &OpError) -> Response {
    match error {
        OpError::NotFound(_) => Response::fault(FaultCode::NotFound, error.to_string()),
        OpError::Invalid(_) => Response::fault(FaultCode::BadRequest, error.to_string()),
    }
}

fn restart_required(key: &str) -> bool {
    ConfigStore::schema()
        .iter()
        .any(|spec| spec.name == key && spec.restart_required)
}

#[async_trait]
impl CommandHandler for Handler {
    async fn handle_request(&self, request: Request) -> herald_control::Result<Response> {
        Ok(match request.command {
            Command::Job(command) => self.handle_job(command).await,
            Command::Config(command) => self.handle_config(command),
            Command::System(command) => self.handle_system(command).await,
        })
    }
}
