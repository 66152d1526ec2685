//! Tunnel watchdog.
//!
//! Each cycle runs every configured liveness check: the local health endpoint,
//! the public URL that reaches this device through the tunnel, and an optional
//! `pgrep -f` for the tunnel process. When the failure counter reaches the
//! threshold the watchdog alerts, runs the restart command and sits out the
//! cooldown before checking again. If the outage outlasts the restart the
//! command runs again each time the threshold is reached; the alert does not.

use async_trait::async_trait;
use bridge_watch::{CheckReport, CheckResult, FailureTracker, LoopPhase, PhaseTracker};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{MonitorLoop, escalate, escalation_policy};
use crate::BridgeContext;
use crate::error::{BridgeError, BridgeResult};
use crate::executor::CommandSpec;

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const RESTART_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WatchdogLoop {
    ctx: Arc<BridgeContext>,
    tracker: FailureTracker,
    http: reqwest::Client,
    interval: Duration,
    local_url: String,
    public_url: Option<String>,
    process: Option<String>,
    restart_command: Option<String>,
    cooldown: Duration,
}

impl WatchdogLoop {
    /// `local_port` is where our own dispatcher listens; it is polled unless
    /// an explicit health URL is configured.
    pub fn new(ctx: Arc<BridgeContext>, local_port: u16) -> BridgeResult<Self> {
        let config = ctx.config.clone();
        let http = reqwest::Client::builder()
            .timeout(CHECK_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Config(format!("watchdog http client: {e}")))?;
        Ok(Self {
            tracker: FailureTracker::new("watchdog", escalation_policy(&ctx)),
            http,
            interval: config.watchdog_interval(),
            local_url: config.local_health_url(local_port),
            public_url: config.public_health_url.clone(),
            process: config.watch_process.clone(),
            restart_command: config.restart_command.clone(),
            cooldown: config.restart_cooldown(),
            ctx,
        })
    }

    pub fn local_url(&self) -> &str {
        &self.local_url
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }

    pub async fn run_checks(&self) -> CheckReport {
        let mut report = CheckReport::default();
        report.push(self.check_url("local_health", &self.local_url).await);
        if let Some(url) = &self.public_url {
            report.push(self.check_url("public_health", url).await);
        }
        if let Some(pattern) = &self.process {
            report.push(self.check_process(pattern).await);
        }
        report
    }

    async fn check_url(&self, name: &str, url: &str) -> CheckResult {
        match self.http.get(url).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => CheckResult::pass(name),
            Ok(resp) => CheckResult::fail(name, format!("HTTP {}", resp.status().as_u16())),
            Err(e) => CheckResult::fail(name, e.to_string()),
        }
    }

    async fn check_process(&self, pattern: &str) -> CheckResult {
        let spec = CommandSpec::argv(["pgrep", "-f", pattern]);
        let out = self.ctx.executor.runner().run(&spec, CHECK_TIMEOUT).await;
        if out.success() {
            CheckResult::pass("process")
        } else {
            CheckResult::fail("process", format!("no process matching '{pattern}'"))
        }
    }

    /// Run the restart command, reset the counter and wait out the cooldown.
    async fn restart(&mut self) {
        let Some(command) = self.restart_command.clone() else {
            warn!("watchdog threshold reached but no restart command configured");
            return;
        };

        info!(command = %command, "running restart command");
        let result = self
            .ctx
            .executor
            .runner()
            .run(&CommandSpec::Shell(command.clone()), RESTART_TIMEOUT)
            .await;
        if result.success() {
            info!(command = %command, "restart command finished");
        } else {
            warn!(
                command = %command,
                returncode = result.returncode,
                stderr = %result.stderr.trim(),
                "restart command failed"
            );
        }

        self.tracker.reset_after_action();
        if !self.cooldown.is_zero() {
            info!(cooldown_secs = self.cooldown.as_secs(), "restart cooldown");
            self.ctx.shutdown.sleep(self.cooldown).await;
        }
    }
}

#[async_trait]
impl MonitorLoop for WatchdogLoop {
    fn name(&self) -> &'static str {
        "watchdog"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn cycle(&mut self, phase: &mut PhaseTracker) {
        phase.enter(LoopPhase::Collecting);
        let report = self.run_checks().await;

        phase.enter(LoopPhase::Reporting);
        let escalation = if report.all_ok() {
            self.tracker.record_success(1)
        } else {
            self.tracker.record_failure(1, report.failure_summary())
        };

        escalate(&self.ctx, &self.tracker, &escalation, "tunnel", phase).await;
        if escalation.needs_action() {
            self.restart().await;
        }
    }
}
