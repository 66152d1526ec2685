//! Heartbeat loop: upserts a liveness row every interval.

use async_trait::async_trait;
use bridge_proto::Heartbeat;
use bridge_push::StateSink;
use bridge_watch::{FailureTracker, LoopPhase, PhaseTracker};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{MonitorLoop, escalate, escalation_policy};
use crate::BridgeContext;

pub struct HeartbeatLoop {
    ctx: Arc<BridgeContext>,
    store: Arc<dyn StateSink>,
    tracker: FailureTracker,
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(ctx: Arc<BridgeContext>, store: Arc<dyn StateSink>) -> Self {
        let policy = escalation_policy(&ctx);
        Self {
            interval: ctx.config.heartbeat_interval(),
            tracker: FailureTracker::new("heartbeat", policy),
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
impl MonitorLoop for HeartbeatLoop {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn cycle(&mut self, phase: &mut PhaseTracker) {
        phase.enter(LoopPhase::Collecting);
        let beat = Heartbeat::online(
            self.ctx.device_id(),
            env!("CARGO_PKG_VERSION"),
            self.ctx.uptime().as_secs(),
        );

        phase.enter(LoopPhase::Reporting);
        let escalation = match self.store.upsert_heartbeat(&beat).await {
            Ok(attempts) => {
                debug!(uptime_secs = beat.uptime_secs, attempts, "heartbeat sent");
                self.tracker.record_success(attempts)
            }
            Err(e) => self.tracker.record_failure(e.attempts(), e.to_string()),
        };

        escalate(&self.ctx, &self.tracker, &escalation, "heartbeat", phase).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::executor::tests::FakeRunner;
    use crate::loops::testutil::{RecordingAlerts, ScriptedStore};
    use crate::shutdown::ShutdownSignal;

    fn setup(script: &[bool]) -> (HeartbeatLoop, Arc<ScriptedStore>, Arc<RecordingAlerts>) {
        let store = Arc::new(ScriptedStore::with_script(script));
        let alerts = Arc::new(RecordingAlerts::default());
        let config = BridgeConfig {
            device_id: "phone-1".to_string(),
            fail_threshold: 3,
            ..BridgeConfig::default()
        };
        let ctx = Arc::new(BridgeContext::new(
            config,
            FakeRunner::ok(),
            alerts.clone(),
            Some(store.clone()),
            ShutdownSignal::new(),
        ));
        (HeartbeatLoop::new(ctx, store.clone()), store, alerts)
    }

    #[tokio::test]
    async fn sends_online_heartbeat() {
        let (mut hb, store, alerts) = setup(&[true]);
        let mut phase = PhaseTracker::new("heartbeat");
        hb.cycle(&mut phase).await;

        let beats = store.heartbeats.lock().unwrap().clone();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].device_id, "phone-1");
        assert_eq!(beats[0].status, "online");
        assert!(alerts.titles().is_empty());
        assert_eq!(phase.phase(), LoopPhase::Reporting);
    }

    #[tokio::test]
    async fn alerts_once_at_threshold_and_recovers_once() {
        let (mut hb, _store, alerts) = setup(&[false, false, false, false, true, true]);
        let mut phase = PhaseTracker::new("heartbeat");

        for _ in 0..3 {
            hb.cycle(&mut phase).await;
        }
        assert_eq!(alerts.titles(), vec!["phone-1: heartbeat DOWN"]);
        assert_eq!(phase.phase(), LoopPhase::Escalating);
        assert_eq!(hb.tracker().outcome().attempts, 5);
        let down = alerts.alerts.lock().unwrap()[0].message.clone();
        assert!(down.contains("HTTP 503: store unavailable"), "{down}");

        hb.cycle(&mut phase).await;
        assert_eq!(alerts.titles().len(), 1);

        hb.cycle(&mut phase).await;
        hb.cycle(&mut phase).await;
        assert_eq!(alerts.titles(), vec!["phone-1: heartbeat DOWN", "phone-1: heartbeat RESTORED"]);
        assert_eq!(hb.tracker().outcome().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn success_below_threshold_is_silent() {
        let (mut hb, _store, alerts) = setup(&[false, false, true]);
        let mut phase = PhaseTracker::new("heartbeat");
        for _ in 0..3 {
            hb.cycle(&mut phase).await;
        }
        assert!(alerts.titles().is_empty());
    }

    #[tokio::test]
    async fn driven_loop_beats_until_shutdown() {
        let (hb, store, _alerts) = setup(&[]);
        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(crate::loops::drive(
            hb.with_interval(Duration::from_millis(10)),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(store.heartbeats.lock().unwrap().len() >= 2);
    }
}
