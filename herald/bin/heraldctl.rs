//! Operator CLI for the herald daemon.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use herald_control::{
    Command, ConfigCommand, ControlClient, JobCommand, ResponseData, ResponsePayload,
    SystemCommand,
};
use herald_engine::JobSpec;

#[derive(Parser)]
#[command(name = "heraldctl", version, about = "Control the herald daemon")]
struct Args {
    /// Control socket path.
    #[arg(long, default_value = "/tmp/herald.sock", env = "HERALD_CONTROL_SOCKET")]
    socket: String,

    #[command(subcommand)]
    command: Cli,
}

#[derive(Subcommand)]
enum Cli {
    /// Health check.
    Ping,
    /// Daemon status.
    Status,
    /// List all jobs.
    List,
    /// Start a job from a JSON spec file.
    Start {
        /// Path to a JSON job spec. Recipients may instead come from
        /// --recipients.
        spec: PathBuf,
        /// Optional newline-separated recipient list file, replacing the
        /// spec's recipients.
        #[arg(long)]
        recipients: Option<PathBuf>,
    },
    /// Pause a running job.
    Pause { job_id: String },
    /// Resume a paused job.
    Resume { job_id: String },
    /// Stop a job cooperatively.
    Stop {
        job_id: String,
        #[arg(long, default_value = "operator stop")]
        reason: String,
    },
    /// Delete a job and all its state.
    Delete { job_id: String },
    /// Show one job with bounded history.
    Job {
        job_id: String,
        #[arg(long, default_value_t = 50)]
        history: usize,
    },
    /// Read one configuration key.
    ConfigGet { key: String },
    /// Write one configuration key.
    ConfigSet { key: String, value: String },
    /// List the full configuration with sources.
    ConfigList,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = ControlClient::new(args.socket);

    let command = match args.command {
        Cli::Ping => Command::System(SystemCommand::Ping),
        Cli::Status => Command::System(SystemCommand::Status),
        Cli::List => Command::Job(JobCommand::List),
        Cli::Start { spec, recipients } => {
            let raw = std::fs::read_to_string(&spec)
                .with_context(|| format!("reading {}", spec.display()))?;
            let mut spec: JobSpec = serde_json::from_str(&raw).context("parsing job spec")?;
            if let Some(path) = recipients {
                let list = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                spec.recipients = list
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(ToString::to_string)
                    .collect();
            }
            Command::start_job(spec)
        }
        Cli::Pause { job_id } => Command::Job(JobCommand::Pause { job_id }),
        Cli::Resume { job_id } => Command::Job(JobCommand::Resume { job_id }),
        Cli::Stop { job_id, reason } => Command::Job(JobCommand::Stop { job_id, reason }),
        Cli::Delete { job_id } => Command::Job(JobCommand::Delete { job_id }),
        Cli::Job { job_id, history } => Command::Job(JobCommand::Status {
            job_id,
            history_limit: history,
        }),
        Cli::ConfigGet { key } => Command::Config(ConfigCommand::Get { key }),
        Cli::ConfigSet { key, value } => Command::Config(ConfigCommand::Set { key, value }),
        Cli::ConfigList => Command::Config(ConfigCommand::List),
    };

    let response = client.request(command).await?;
    match response.payload {
        ResponsePayload::Ok => println!("ok"),
        ResponsePayload::Data(data) => print_data(*data)?,
        ResponsePayload::Error(fault) => {
            bail!("{:?}: {}", fault.code, fault.message);
        }
    }
    Ok(())
}

fn print_data(data: ResponseData) -> anyhow::Result<()> {
    match data {
        ResponseData::Message(message) => println!("{message}"),
        ResponseData::JobStarted { job_id } => println!("{job_id}"),
        ResponseData::JobStatus(view) => println!("{}", serde_json::to_string_pretty(&view)?),
        ResponseData::JobList(views) => {
            for view in views {
                println!(
                    "{}  {:8}  campaign={}  sent={}/{} delivered={} bounced={} deferred={} complained={}",
                    view.id,
                    view.status.as_str(),
                    view.campaign_id,
                    view.counters.sent,
                    view.counters.total,
                    view.counters.delivered,
                    view.counters.bounced,
                    view.counters.deferred,
                    view.counters.complained,
                );
            }
        }
        ResponseData::ConfigValue(value) => {
            println!("{} = {}  ({})", value.key, value.value, value.source);
        }
        ResponseData::ConfigList(values) => {
            for value in values {
                let restart = if value.restart_required {
                    "  [restart required]"
                } else {
                    ""
                };
                println!(
                    "{} = {}  ({}){restart}",
                    value.key, value.value, value.source
                );
            }
        }
        ResponseData::SystemStatus(status) => {
            println!("herald {}", status.version);
            println!("uptime: {}s", status.uptime_secs);
            println!("jobs: {} total, {} active", status.jobs_total, status.jobs_active);
            println!("monitor: {}", if status.monitor_ok { "ok" } else { "unreachable" });
        }
    }
    Ok(())
}
