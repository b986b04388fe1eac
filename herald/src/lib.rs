//! Daemon wiring.
//!
//! Builds the store, configuration, monitor, preflight and engine pieces,
//! restores persisted jobs, and runs the control server plus the
//! accounting poller until a shutdown signal.

pub mod control_handler;

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use ahash::AHashMap;
use herald_accounting::{BridgeClient, Tailer, TailerConfig};
use herald_common::{config::OverridePersistence, ConfigStore, Signal};
use herald_control::ControlServer;
use herald_engine::{
    persist::Persister, AccountingPoller, FeedSource, JobController, JobTable, OutcomeStore,
    Reconciler, RecipientRegistry,
};
use herald_monitor::{MonitorClient, MonitorConfig, PressureController};
use herald_preflight::{
    CommandScorer, ContentScorer, DisabledScorer, DnsblClient, PreflightGate, SpamdScorer,
};
use herald_store::{Store, Table};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::control_handler::Handler;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Bridge cursor key in the offsets table.
const ACCT_CURSOR_KEY: &str = "acct";

/// Synchronous override persistence into the store's config table. Config
/// writes are rare and tiny, so a blocking write is fine even on a runtime
/// thread; the blob format matches what `Store::get::<String>` reads back.
struct StoreOverrides {
    dir: std::path::PathBuf,
}

impl OverridePersistence for StoreOverrides {
    fn persist(&self, key: &str, value: &str) -> Result<(), String> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy())
            .map_err(|e| e.to_string())?;
        let path = self.dir.join(format!("{key}.bin"));
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|e| e.to_string())?;
        std::fs::rename(&tmp, &path).map_err(|e| e.to_string())
    }
}

/// The assembled daemon.
pub struct Herald {
    config: Arc<ConfigStore>,
    controller: Arc<JobController>,
    reconciler: Arc<Reconciler>,
    persister: Arc<Persister>,
    store: Arc<Store>,
    monitor: Option<Arc<MonitorClient>>,
}

impl Herald {
    /// Build every component and restore persisted state.
    ///
    /// # Errors
    /// Store or client construction failures.
    pub async fn build() -> anyhow::Result<Self> {
        // Bootstrap configuration: defaults and environment only, enough to
        // find the data directory.
        let bootstrap = ConfigStore::new();
        let data_dir = bootstrap.get_str("data_dir");
        let store = Arc::new(Store::open(&data_dir).await?);

        // Seed the override layer from the durable config table.
        let mut seeded = AHashMap::new();
        for key in store.keys(Table::Config).await? {
            if let Some(value) = store.get::<String>(Table::Config, &key).await? {
                seeded.insert(key, value);
            }
        }
        let config = Arc::new(ConfigStore::new().with_persistence(
            Arc::new(StoreOverrides {
                dir: store.root().join("config"),
            }),
            seeded,
        ));

        let policy = config.snapshot();
        let monitor = if policy.monitor_url.is_empty() {
            None
        } else {
            Some(Arc::new(MonitorClient::new(MonitorConfig {
                base_url: policy.monitor_url.clone(),
                api_key: (!policy.monitor_api_key.is_empty())
                    .then(|| policy.monitor_api_key.clone()),
                timeout: Duration::from_secs_f64(policy.monitor_timeout_secs.max(1.0)),
                cache_ttl: Duration::from_secs_f64(policy.monitor_cache_ttl_secs.max(0.5)),
                strict: policy.monitor_strict,
                allow_insecure_retry: policy.monitor_insecure_retry,
            })?))
        };

        let scorer: Arc<dyn ContentScorer> = if !policy.spamd_addr.is_empty() {
            Arc::new(SpamdScorer::new(policy.spamd_addr.clone()))
        } else if !policy.spam_score_cmd.is_empty() {
            let mut parts = policy.spam_score_cmd.split_whitespace();
            let program = parts.next().unwrap_or_default().to_string();
            Arc::new(CommandScorer::new(
                program,
                parts.map(ToString::to_string).collect(),
            ))
        } else {
            Arc::new(DisabledScorer)
        };
        let dnsbl = Arc::new(DnsblClient::new(
            policy.rbl_zones.clone(),
            policy.dbl_zones.clone(),
        ));
        let gate = Arc::new(PreflightGate::new(scorer, dnsbl));
        let pressure = Arc::new(PressureController::new(monitor.clone()));

        let jobs = Arc::new(JobTable::new());
        let outcomes = Arc::new(OutcomeStore::new());
        let registry = Arc::new(RecipientRegistry::new());
        let persister = Arc::new(Persister::new(
            store.clone(),
            config.clone(),
            outcomes.clone(),
            registry.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            jobs.clone(),
            outcomes.clone(),
            registry.clone(),
        ));
        let controller = Arc::new(JobController::new(
            jobs,
            outcomes,
            registry,
            config.clone(),
            persister.clone(),
            pressure,
            gate,
            monitor.clone(),
            SHUTDOWN_BROADCAST.clone(),
        ));

        controller.restore().await;

        Ok(Self {
            config,
            controller,
            reconciler,
            persister,
            store,
            monitor,
        })
    }

    /// Run the control server and the accounting poller until shutdown.
    ///
    /// # Errors
    /// Fatal control-server failures.
    pub async fn run(self) -> anyhow::Result<()> {
        let policy = self.config.snapshot();

        // Accounting feed: the HTTP bridge when configured, the direct
        // tailer otherwise.
        let source = if policy.bridge_url.is_empty() {
            info!(dir = %policy.acct_dir, "using direct accounting tailer");
            FeedSource::Direct(Tailer::with_type_map(
                TailerConfig {
                    dir: policy.acct_dir.clone().into(),
                    ..TailerConfig::default()
                },
                &policy.acct_type_map,
            ))
        } else {
            info!(url = %policy.bridge_url, "using accounting bridge");
            let token = (!policy.bridge_token.is_empty()).then(|| policy.bridge_token.clone());
            FeedSource::Bridge(
                BridgeClient::new(policy.bridge_url.clone(), token)?
                    .with_type_map(&policy.acct_type_map),
            )
        };
        let poller = AccountingPoller {
            source,
            reconciler: self.reconciler.clone(),
            persister: self.persister.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            cursor_key: ACCT_CURSOR_KEY.to_string(),
        };
        let poller_task = tokio::spawn(poller.run(SHUTDOWN_BROADCAST.subscribe()));

        let handler = Arc::new(Handler::new(
            self.controller.clone(),
            self.config.clone(),
            self.monitor.clone(),
        ));
        let socket_path = self.config.get_str("control_socket");
        let server = ControlServer::new(socket_path, handler);

        let result = tokio::select! {
            result = server.serve(SHUTDOWN_BROADCAST.subscribe()) => result,
            () = shutdown_signal() => {
                info!("shutdown signal received");
                let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
                Ok(())
            }
        };

        if let Err(e) = &result {
            error!(error = %e, "control server failed");
            let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
        }

        if let Err(e) = poller_task.await {
            warn!(error = %e, "poller task join failed");
        }

        result.map_err(Into::into)
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!(error = %e, "terminate handler unavailable");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
