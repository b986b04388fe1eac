//! End-to-end: inject through a mock SMTP server, then reconcile the
//! accounting rows the MTA would have produced.

mod support;

use std::sync::Arc;
use std::time::Duration;

use herald_common::{ConfigStore, Signal};
use herald_engine::{
    persist::Persister, JobController, JobStatus, JobTable, OutcomeStore, Reconciler,
    RecipientRegistry,
};
use herald_monitor::PressureController;
use herald_preflight::{DisabledScorer, DnsblClient, PreflightGate};
use herald_accounting::LineParser;
use tokio::sync::broadcast;

use support::mock_server::{MockConfig, MockSmtpServer};

struct Harness {
    controller: JobController,
    reconciler: Reconciler,
    outcomes: Arc<OutcomeStore>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let jobs = Arc::new(JobTable::new());
    let outcomes = Arc::new(OutcomeStore::new());
    let registry = Arc::new(RecipientRegistry::new());
    let config = Arc::new(ConfigStore::new());
    let store = Arc::new(herald_store::Store::open(dir.path()).await.unwrap());
    let persister = Arc::new(Persister::new(
        store,
        config.clone(),
        outcomes.clone(),
        registry.clone(),
    ));
    let gate = Arc::new(PreflightGate::new(
        Arc::new(DisabledScorer),
        Arc::new(DnsblClient::new(Vec::new(), Vec::new())),
    ));
    let (shutdown, _): (broadcast::Sender<Signal>, _) = broadcast::channel(8);

    let controller = JobController::new(
        jobs.clone(),
        outcomes.clone(),
        registry.clone(),
        config,
        persister,
        Arc::new(PressureController::new(None)),
        gate,
        None,
        shutdown,
    );
    let reconciler = Reconciler::new(jobs, outcomes.clone(), registry);

    Harness {
        controller,
        reconciler,
        outcomes,
        _dir: dir,
    }
}

fn spec_json(host: &str, port: u16, recipients: &[&str]) -> herald_engine::JobSpec {
    serde_json::from_value(serde_json::json!({
        "campaign_id": "camp001",
        "smtp": {"host": host, "port": port},
        "senders": [{"name": "News", "email": "news@sender.example"}],
        "subjects": ["Weekly"],
        "bodies": ["Hello [URL]"],
        "url_pool": ["https://link.example/a", "https://link.example/b"],
        "recipients": recipients,
        "thread_workers": 2,
        "backoff_enabled": false
    }))
    .unwrap()
}

async fn wait_terminal(controller: &JobController, job_id: &str) -> JobStatus {
    for _ in 0..200 {
        let view = controller.status(job_id, 10).unwrap();
        if view.status.is_terminal() {
            return view.status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_delivered_end_to_end() {
    let server = MockSmtpServer::start(MockConfig::default()).await;
    let harness = harness().await;

    let job_id = harness
        .controller
        .start(spec_json(&server.host(), server.port(), &["alice@example.com"]))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&harness.controller, &job_id).await, JobStatus::Done);

    let view = harness.controller.status(&job_id, 10).unwrap();
    assert_eq!(view.counters.sent, 1);
    assert_eq!(view.counters.failed, 0);

    // The injected message carries the correlation headers.
    let messages = server.messages().await;
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert!(message.contains(&format!("X-Job-ID: {job_id}")));
    assert!(message.contains("X-Campaign-ID: camp001"));
    let message_id = message
        .lines()
        .find_map(|line| line.strip_prefix("Message-ID: "))
        .expect("message id header")
        .trim()
        .to_string();

    // The MTA's accounting row comes back and reconciles onto the job.
    let mut parser = LineParser::new();
    let event = parser
        .parse_line("acct-1.csv", &format!("d,alice@example.com,{message_id}"))
        .unwrap();
    harness.reconciler.apply(&event);

    let view = harness.controller.status(&job_id, 10).unwrap();
    assert_eq!(view.counters.delivered, 1);
    assert_eq!(view.counters.bounced, 0);
    assert_eq!(
        harness.outcomes.row(&job_id, "alice@example.com"),
        Some(herald_engine::OutcomeStatus::Delivered)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deferred_then_delivered_end_to_end() {
    let server = MockSmtpServer::start(MockConfig::default()).await;
    let harness = harness().await;

    let job_id = harness
        .controller
        .start(spec_json(&server.host(), server.port(), &["bob@example.com"]))
        .await
        .unwrap();
    wait_terminal(&harness.controller, &job_id).await;

    let messages = server.messages().await;
    let message_id = messages[0]
        .lines()
        .find_map(|line| line.strip_prefix("Message-ID: "))
        .unwrap()
        .trim()
        .to_string();

    let mut parser = LineParser::new();
    let deferred = parser
        .parse_line("acct-1.csv", &format!("t,bob@example.com,{message_id}"))
        .unwrap();
    harness.reconciler.apply(&deferred);
    let view = harness.controller.status(&job_id, 10).unwrap();
    assert_eq!(view.counters.deferred, 1);
    assert_eq!(view.counters.delivered, 0);

    let delivered = parser
        .parse_line("acct-1.csv", &format!("d,bob@example.com,{message_id}"))
        .unwrap();
    harness.reconciler.apply(&delivered);
    let view = harness.controller.status(&job_id, 10).unwrap();
    assert_eq!(view.counters.deferred, 0);
    assert_eq!(view.counters.delivered, 1);
    assert_eq!(
        harness.outcomes.row(&job_id, "bob@example.com"),
        Some(herald_engine::OutcomeStatus::Delivered)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_recipients_count_as_failed() {
    let server = MockSmtpServer::start(MockConfig {
        rcpt_code: 550,
        rcpt_message: "user unknown".to_string(),
    })
    .await;
    let harness = harness().await;

    let job_id = harness
        .controller
        .start(spec_json(
            &server.host(),
            server.port(),
            &["a@example.com", "b@example.com", "c@example.com"],
        ))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&harness.controller, &job_id).await, JobStatus::Done);

    let view = harness.controller.status(&job_id, 10).unwrap();
    assert_eq!(view.counters.failed, 3);
    assert_eq!(view.counters.sent, 0);
    assert!(view
        .failure_categories
        .get(&herald_engine::job::FailureCategory::Refused)
        .is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multi_domain_dispatch_order() {
    let server = MockSmtpServer::start(MockConfig::default()).await;
    let harness = harness().await;

    // One worker so the per-domain insertion order is observable end to
    // end (across workers no per-recipient order is promised).
    let mut spec = spec_json(
        &server.host(),
        server.port(),
        &[
            "a1@gmail.test",
            "a2@gmail.test",
            "b1@yahoo.test",
            "b2@yahoo.test",
        ],
    );
    spec.thread_workers = 1;
    let job_id = harness.controller.start(spec).await.unwrap();
    assert_eq!(wait_terminal(&harness.controller, &job_id).await, JobStatus::Done);

    let view = harness.controller.status(&job_id, 10).unwrap();
    assert_eq!(view.counters.sent, 4);
    assert_eq!(view.domain_sent.get("gmail.test"), Some(&2));
    assert_eq!(view.domain_sent.get("yahoo.test"), Some(&2));
    assert_eq!(view.domain_plan.get("gmail.test"), Some(&2));

    // Per receiver domain, recipients went out in insertion order.
    let messages = server.messages().await;
    let recipients: Vec<String> = messages
        .iter()
        .filter_map(|message| {
            message
                .lines()
                .find_map(|line| line.strip_prefix("To: "))
                .map(ToString::to_string)
        })
        .collect();
    let gmail: Vec<&String> = recipients.iter().filter(|r| r.contains("gmail")).collect();
    assert_eq!(gmail, vec!["a1@gmail.test", "a2@gmail.test"]);
}
