//! State reporter: probes the device and upserts the full snapshot.

use async_trait::async_trait;
use bridge_push::StateSink;
use bridge_watch::{FailureTracker, LoopPhase, PhaseTracker};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{MonitorLoop, escalate, escalation_policy};
use crate::BridgeContext;

pub struct ReporterLoop {
    ctx: Arc<BridgeContext>,
    store: Arc<dyn StateSink>,
    tracker: FailureTracker,
    interval: Duration,
}

impl ReporterLoop {
    pub fn new(ctx: Arc<BridgeContext>, store: Arc<dyn StateSink>) -> Self {
        let policy = escalation_policy(&ctx);
        Self {
            interval: ctx.config.state_push_interval(),
            tracker: FailureTracker::new("state_reporter", policy),
            ctx,
            store,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn tracker(&self) -> &FailureTracker {
        &self.tracker
    }
}

#[async_trait]
impl MonitorLoop for ReporterLoop {
    fn name(&self) -> &'static str {
        "state_reporter"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn cycle(&mut self, phase: &mut PhaseTracker) {
        phase.enter(LoopPhase::Collecting);
        let state = self.ctx.probe.collect(self.tracker.outcome().last_ok).await;

        phase.enter(LoopPhase::Reporting);
        let pushed = self.store.upsert_state(&state).await;
        debug!(
            ok = pushed.is_ok(),
            battery_pct = state.battery_pct,
            network = %state.network,
            "state pushed"
        );
        self.ctx.publish_state(state);

        let escalation = match pushed {
            Ok(attempts) => self.tracker.record_success(attempts),
            Err(e) => self.tracker.record_failure(e.attempts(), e.to_string()),
        };
        escalate(&self.ctx, &self.tracker, &escalation, "state push", phase).await;
    }
}
