//! bridged — device bridge daemon
//!
//! Serves an authenticated HTTP control surface for command execution and
//! device actuation, and runs the heartbeat, state-reporter and watchdog
//! monitors alongside it.

#![forbid(unsafe_code)]

pub mod actuation;
pub mod auth;
pub mod config;
pub mod denylist;
pub mod error;
pub mod executor;
pub mod http;
pub mod loops;
pub mod probe;
pub mod request;
pub mod shutdown;

use bridge_proto::{Alert, DeviceState};
use bridge_push::{
    AlertSink, DisabledNotifier, Notifier, PushResult, RetryingHttpClient, StateSink, StateStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use shutdown::ShutdownSignal;

use actuation::Actuator;
use denylist::DenyList;
use executor::{CommandExecutor, CommandRunner, ShellRunner};
use probe::DeviceProbe;

// ─── Shared context ───────────────────────────────────────────────────────────

/// Everything the dispatcher and the loops share. Read-only apart from the
/// latest-snapshot channel.
pub struct BridgeContext {
    pub config: Arc<BridgeConfig>,
    pub executor: CommandExecutor,
    pub actuator: Actuator,
    pub probe: DeviceProbe,
    pub alerts: Arc<dyn AlertSink>,
    pub store: Option<Arc<dyn StateSink>>,
    pub shutdown: ShutdownSignal,
    pub started_at: Instant,
    latest: watch::Sender<Option<DeviceState>>,
}

impl BridgeContext {
    /// Assemble a context from explicit collaborators.
    pub fn new(
        config: BridgeConfig,
        runner: Arc<dyn CommandRunner>,
        alerts: Arc<dyn AlertSink>,
        store: Option<Arc<dyn StateSink>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let started_at = Instant::now();
        let deny = DenyList::new(config.deny_list_enabled, &config.deny_extra);
        let executor = CommandExecutor::new(
            runner.clone(),
            deny,
            config.exec_timeout(),
            config.exec_max_timeout(),
        );
        let actuator = Actuator::new(
            runner.clone(),
            config.record_dir.clone(),
            config.write_root.clone(),
        );
        let probe = DeviceProbe::new(
            runner,
            config.device_id.clone(),
            config.storage_path.clone(),
            started_at,
        );
        let (latest, _) = watch::channel(None);

        Self {
            config: Arc::new(config),
            executor,
            actuator,
            probe,
            alerts,
            store,
            shutdown,
            started_at,
            latest,
        }
    }

    /// Production wiring: shell runner, ntfy notifier and PostgREST store as
    /// configured. Unconfigured sinks are disabled, not errors.
    pub fn production(config: BridgeConfig, shutdown: ShutdownSignal) -> BridgeResult<Self> {
        let client = RetryingHttpClient::new(config.retry_policy(), config.push_timeout())?
            .with_shutdown(shutdown.token());

        let alerts: Arc<dyn AlertSink> = match &config.ntfy_url {
            Some(url) => Arc::new(Notifier::new(client.clone(), url.clone())),
            None => {
                warn!("NTFY_URL not set, alerts are disabled");
                Arc::new(DisabledNotifier)
            }
        };

        let store: Option<Arc<dyn StateSink>> = match config.state_store() {
            Some((url, key)) => {
                info!(url, "state store configured");
                Some(Arc::new(StateStore::new(client, url, key, config.store_tables())))
            }
            None => {
                warn!("STATE_STORE_URL/STATE_STORE_KEY not set, state pushes are disabled");
                None
            }
        };

        Ok(Self::new(config, Arc::new(ShellRunner), alerts, store, shutdown))
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Most recent snapshot published by the reporter, if any.
    pub fn latest_state(&self) -> Option<DeviceState> {
        self.latest.borrow().clone()
    }

    pub fn publish_state(&self, state: DeviceState) {
        self.latest.send_replace(Some(state));
    }

    /// Probe the device and upsert the snapshot, then publish it. Returns
    /// `None` when no store is configured.
    pub async fn push_state_now(&self, last_push_ok: Option<bool>) -> Option<PushResult<u32>> {
        let store = self.store.as_ref()?;
        let state = self.probe.collect(last_push_ok).await;
        let pushed = store.upsert_state(&state).await;
        self.publish_state(state);
        Some(pushed)
    }

    pub async fn notify(&self, alert: Alert) -> bool {
        self.alerts.notify(&alert).await
    }
}
