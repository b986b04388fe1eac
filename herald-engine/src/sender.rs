//! The sender pool: a bounded worker group delivering one chunk.
//!
//! Every chunk targets one receiver domain with one sender identity. Each
//! worker owns one SMTP connection for the duration of the chunk and never
//! buffers beyond the message in flight. Workers check pause/stop between
//! recipients and between delay slices; a stop completes the in-flight send
//! but starts no new one.

use std::sync::Arc;
use std::time::Duration;

use herald_common::{Domain, SenderIdentity};
use herald_monitor::MonitorClient;
use herald_smtp::{CampaignMessage, ClientError, SmtpClient};
use rand::Rng;
use tracing::{debug, warn};

use crate::{
    ids::format_message_id,
    job::{FailureCategory, Job},
    registry::RecipientRegistry,
    render,
};

/// Cancellation checks slice every wait into quanta no longer than this.
pub const WAIT_SLICE: Duration = Duration::from_millis(350);

/// Minimum spacing between MTA diagnostic snapshots for one domain.
const DIAG_INTERVAL: Duration = Duration::from_secs(30);

/// One chunk, fully decided: recipients, identity, rendering variants.
#[derive(Debug, Clone)]
pub struct ChunkAssignment {
    pub index: u32,
    pub domain: Domain,
    pub recipients: Vec<String>,
    pub sender: SenderIdentity,
    pub subject: String,
    pub body_template: String,
    pub attempt: u32,
}

/// What one chunk run produced.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkReport {
    pub sent: usize,
    pub failed: usize,
    /// True when the run ended early on a stop request.
    pub stopped: bool,
}

pub struct SenderPool;

impl SenderPool {
    /// Deliver one chunk with up to `workers` concurrent connections.
    pub async fn send_chunk(
        job: &Arc<Job>,
        registry: &Arc<RecipientRegistry>,
        monitor: Option<Arc<MonitorClient>>,
        assignment: ChunkAssignment,
        workers: usize,
        delay_s: f64,
    ) -> ChunkReport {
        let workers = workers.clamp(1, assignment.recipients.len().max(1));
        let assignment = Arc::new(assignment);

        // Round-robin split keeps per-worker lists balanced without
        // reordering within a worker.
        let mut lists: Vec<Vec<String>> = vec![Vec::new(); workers];
        for (i, recipient) in assignment.recipients.iter().enumerate() {
            lists[i % workers].push(recipient.clone());
        }

        let mut handles = Vec::with_capacity(workers);
        for (worker_index, recipients) in lists.into_iter().enumerate() {
            if recipients.is_empty() {
                continue;
            }
            let job = job.clone();
            let registry = registry.clone();
            let monitor = monitor.clone();
            let assignment = assignment.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(
                    &job,
                    &registry,
                    monitor,
                    &assignment,
                    worker_index as u32,
                    recipients,
                    delay_s,
                )
                .await
            }));
        }

        let mut report = ChunkReport::default();
        for handle in handles {
            match handle.await {
                Ok(worker_report) => {
                    report.sent += worker_report.sent;
                    report.failed += worker_report.failed;
                    report.stopped |= worker_report.stopped;
                }
                Err(e) => {
                    // A panicked worker is contained here; its recipients
                    // were already accounted as they were processed.
                    warn!(error = %e, "sender worker aborted");
                }
            }
        }
        report
    }
}

async fn worker_loop(
    job: &Arc<Job>,
    registry: &Arc<RecipientRegistry>,
    monitor: Option<Arc<MonitorClient>>,
    assignment: &ChunkAssignment,
    worker_index: u32,
    recipients: Vec<String>,
    delay_s: f64,
) -> ChunkReport {
    let mut report = ChunkReport::default();
    let mut rng = render::rng_for(&job.id, assignment.index, worker_index);
    let smtp = &job.spec.smtp;
    let op_timeout = Duration::from_secs_f64(smtp.timeout_secs.max(1.0));

    let mut client = match connect(job, op_timeout).await {
        Ok(client) => Some(client),
        Err(e) => {
            // No connection at all: every recipient of this worker fails
            // with the same category.
            let (category, code) = categorize(&e);
            for recipient in &recipients {
                job.record_send_failure(
                    recipient,
                    &assignment.domain,
                    category,
                    code,
                    e.to_string(),
                );
                report.failed += 1;
            }
            maybe_diag(job, &monitor, &assignment.domain).await;
            return report;
        }
    };

    let mut sequence = 0u32;
    for recipient in &recipients {
        if job.stop_requested() {
            report.stopped = true;
            break;
        }
        if wait_while_paused(job).await {
            report.stopped = true;
            break;
        }

        let body = render::render_body(
            &assignment.body_template,
            &job.spec.url_pool,
            &job.spec.src_pool,
            &mut rng,
        );
        let opaque = format!("{:08x}{sequence:04x}", rng.random::<u32>());
        sequence = sequence.wrapping_add(1);
        let message_id = format_message_id(
            &opaque,
            &job.id,
            &job.campaign_id,
            assignment.index,
            worker_index,
            "herald.local",
        );

        let message = CampaignMessage {
            from: assignment.sender.clone(),
            to: recipient.clone(),
            subject: assignment.subject.clone(),
            reply_to: job.spec.reply_to.clone(),
            format: job.spec.format,
            body,
            message_id,
            job_id: job.id.clone(),
            campaign_id: job.campaign_id.clone(),
        };

        let result = match client.as_mut() {
            Some(connection) => {
                transact(connection, &assignment.sender.email, recipient, &message, op_timeout)
                    .await
            }
            None => Err(ClientError::Disconnected),
        };

        match result {
            Ok(()) => {
                job.record_send_success(recipient, &assignment.domain);
                registry.record(&job.id, &job.campaign_id, recipient);
                report.sent += 1;
            }
            Err(e) => {
                let (category, code) = categorize(&e);
                job.record_send_failure(
                    recipient,
                    &assignment.domain,
                    category,
                    code,
                    e.to_string(),
                );
                report.failed += 1;
                maybe_diag(job, &monitor, &assignment.domain).await;

                match e {
                    // Connection-level failures poison the session;
                    // reconnect once and carry on.
                    ClientError::Io(_) | ClientError::Disconnected | ClientError::Timeout(_) => {
                        client = connect(job, op_timeout).await.ok();
                    }
                    // A rejected envelope leaves the session healthy but
                    // mid-transaction; clear it before the next recipient.
                    ClientError::Rejected { .. } => {
                        if let Some(connection) = client.as_mut() {
                            let _ = connection.reset().await;
                        }
                    }
                    _ => {}
                }
            }
        }

        if delay_s > 0.0 && sliced_wait(job, Duration::from_secs_f64(delay_s)).await {
            report.stopped = true;
            break;
        }
    }

    if let Some(mut connection) = client {
        let _ = tokio::time::timeout(Duration::from_secs(10), connection.quit()).await;
    }

    debug!(
        job = %job.id,
        chunk = assignment.index,
        worker = worker_index,
        sent = report.sent,
        failed = report.failed,
        "worker finished"
    );
    report
}

/// Bounded step: wrap one client call in the per-operation deadline.
async fn step<T>(
    what: &str,
    op_timeout: Duration,
    future: impl std::future::Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::time::timeout(op_timeout, future)
        .await
        .map_err(|_| ClientError::Timeout(what.to_string()))?
}

/// Open a session per the job's SMTP settings: connect (greeting included),
/// EHLO, optional STARTTLS with the post-upgrade EHLO, optional AUTH. The
/// client itself turns negative replies into errors, so this is a straight
/// sequence of bounded steps.
async fn connect(job: &Arc<Job>, op_timeout: Duration) -> Result<SmtpClient, ClientError> {
    let smtp = &job.spec.smtp;
    let mut client = step(
        "connect",
        op_timeout,
        SmtpClient::connect(
            &smtp.host,
            smtp.port,
            smtp.security,
            smtp.accept_invalid_certs,
        ),
    )
    .await?;

    step("EHLO", op_timeout, client.hello("herald.local")).await?;

    if smtp.security == herald_smtp::SecurityMode::StartTls {
        step("STARTTLS", op_timeout, client.starttls()).await?;
        // RFC 3207: the session resets after the TLS handshake.
        step("EHLO after STARTTLS", op_timeout, client.hello("herald.local")).await?;
    }

    if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
        step("AUTH", op_timeout, client.auth(username, password)).await?;
    }

    Ok(client)
}

/// One envelope: MAIL FROM, RCPT TO, then the whole DATA phase. Rejections
/// arrive as errors carrying their reply code.
async fn transact(
    client: &mut SmtpClient,
    mail_from: &str,
    rcpt_to: &str,
    message: &CampaignMessage,
    op_timeout: Duration,
) -> Result<(), ClientError> {
    let rendered = message.build();

    step("MAIL FROM", op_timeout, client.mail_from(mail_from)).await?;
    step("RCPT TO", op_timeout, client.rcpt_to(rcpt_to)).await?;
    step(
        "message data",
        op_timeout.max(Duration::from_secs(60)),
        client.send_message(&rendered),
    )
    .await?;

    Ok(())
}

/// Failure category and, for rejected envelopes, the reply code.
fn categorize(error: &ClientError) -> (FailureCategory, Option<u16>) {
    match error {
        ClientError::Timeout(_) => (FailureCategory::Timeout, None),
        ClientError::AuthFailed(_) => (FailureCategory::Auth, None),
        ClientError::Rejected { code, .. } => (FailureCategory::Refused, Some(*code)),
        ClientError::Io(e) => {
            // getaddrinfo failures surface as I/O errors on connect.
            if e.to_string().to_ascii_lowercase().contains("lookup") {
                (FailureCategory::Dns, None)
            } else {
                (FailureCategory::Connection, None)
            }
        }
        ClientError::Disconnected | ClientError::Tls(_) => (FailureCategory::Connection, None),
        ClientError::BadReply(_) => (FailureCategory::Other, None),
    }
}

/// Attach a one-line MTA queue snapshot for the domain, rate-limited.
async fn maybe_diag(job: &Arc<Job>, monitor: &Option<Arc<MonitorClient>>, domain: &Domain) {
    let Some(monitor) = monitor else { return };
    if !monitor.is_configured() {
        return;
    }

    let due = job.with_state(|state| {
        let now = std::time::Instant::now();
        match state.last_diag_at.get(domain.as_str()) {
            Some(last) if now.duration_since(*last) < DIAG_INTERVAL => false,
            _ => {
                state.last_diag_at.insert(domain.to_string(), now);
                true
            }
        }
    });
    if !due {
        return;
    }

    match monitor.domain_detail(domain).await {
        Ok(detail) => {
            job.with_state(|state| {
                state.last_error = Some(format!(
                    "{domain}: queued={} deferred={} errors={}",
                    detail.queued, detail.deferred, detail.errors
                ));
            });
        }
        Err(e) => debug!(domain = %domain, error = %e, "diag snapshot unavailable"),
    }
}

/// Wait while the job is paused. Returns true when a stop arrived instead
/// of a resume.
async fn wait_while_paused(job: &Arc<Job>) -> bool {
    while job.paused() {
        if job.stop_requested() {
            return true;
        }
        tokio::time::sleep(WAIT_SLICE).await;
    }
    false
}

/// Sleep in cancellation-sized slices. Returns true on stop.
pub async fn sliced_wait(job: &Arc<Job>, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if job.stop_requested() {
            return true;
        }
        let slice = remaining.min(WAIT_SLICE);
        tokio::time::sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
    job.stop_requested()
}
