//! Background monitors.
//!
//! Each monitor owns its own [`FailureTracker`] and runs as an independent
//! task. [`drive`] provides the shared skeleton: sleep the interval, run one
//! cycle, repeat until shutdown. A panic inside a cycle is logged and the loop
//! goes back to sleeping.

pub mod heartbeat;
pub mod reporter;
pub mod watchdog;

use async_trait::async_trait;
use bridge_proto::Severity;
use bridge_watch::{Escalation, EscalationPolicy, FailureTracker, LoopPhase, PhaseTracker};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::BridgeContext;
use crate::shutdown::ShutdownSignal;

pub use heartbeat::HeartbeatLoop;
pub use reporter::ReporterLoop;
pub use watchdog::WatchdogLoop;

/// One periodic monitor.
#[async_trait]
pub trait MonitorLoop: Send {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One Collecting/Reporting/Escalating pass. Must not return errors; any
    /// failure is recorded in the monitor's own tracker.
    async fn cycle(&mut self, phase: &mut PhaseTracker);
}

/// Run `monitor` until `shutdown` fires. Shutdown interrupts both the sleep
/// and an in-flight cycle.
pub async fn drive<L: MonitorLoop>(mut monitor: L, shutdown: ShutdownSignal) {
    let name = monitor.name();
    let mut phase = PhaseTracker::new(name);
    info!(loop_name = name, interval_secs = monitor.interval().as_secs_f64(), "loop started");

    loop {
        phase.enter(LoopPhase::Sleeping);
        if !shutdown.sleep(monitor.interval()).await {
            break;
        }

        let cycle = AssertUnwindSafe(monitor.cycle(&mut phase)).catch_unwind();
        tokio::select! {
            _ = shutdown.triggered() => break,
            result = cycle => {
                if let Err(panic) = result {
                    let detail = panic_detail(panic.as_ref());
                    error!(loop_name = name, panic = detail, "cycle panicked");
                }
            }
        }
    }

    phase.enter(LoopPhase::Terminated);
    info!(loop_name = name, "loop stopped");
}

/// Spawn every monitor the configuration supports. `local_port` is the port
/// the dispatcher actually bound, which the watchdog polls.
pub fn spawn_all(ctx: &std::sync::Arc<BridgeContext>, local_port: u16) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    match &ctx.store {
        Some(store) => {
            handles.push(tokio::spawn(drive(
                HeartbeatLoop::new(ctx.clone(), store.clone()),
                ctx.shutdown.clone(),
            )));
            handles.push(tokio::spawn(drive(
                ReporterLoop::new(ctx.clone(), store.clone()),
                ctx.shutdown.clone(),
            )));
        }
        None => warn!("state store not configured, heartbeat and state reporter not started"),
    }

    match WatchdogLoop::new(ctx.clone(), local_port) {
        Ok(watchdog) => handles.push(tokio::spawn(drive(watchdog, ctx.shutdown.clone()))),
        Err(e) => error!(error = %e, "watchdog not started"),
    }
    handles
}

/// Outage alerts go out at high priority once `fail_threshold` is reached.
pub(crate) fn escalation_policy(ctx: &BridgeContext) -> EscalationPolicy {
    EscalationPolicy::new(ctx.config.fail_threshold, Severity::High)
}

/// Fire the notification `escalation` calls for, if any.
pub(crate) async fn escalate(
    ctx: &BridgeContext,
    tracker: &FailureTracker,
    escalation: &Escalation,
    subject: &str,
    phase: &mut PhaseTracker,
) {
    if let Some(alert) = tracker.alert_for(escalation, ctx.device_id(), subject) {
        phase.enter(LoopPhase::Escalating);
        ctx.notify(alert).await;
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        runs: Arc<AtomicU32>,
        panic_on: u32,
    }

    #[async_trait]
    impl MonitorLoop for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn cycle(&mut self, phase: &mut PhaseTracker) {
            phase.enter(LoopPhase::Collecting);
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.panic_on {
                panic!("cycle {n} blew up");
            }
        }
    }

    struct Stuck;

    #[async_trait]
    impl MonitorLoop for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(1)
        }

        async fn cycle(&mut self, _phase: &mut PhaseTracker) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn panicking_cycle_does_not_stop_the_loop() {
        let runs = Arc::new(AtomicU32::new(0));
        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(drive(
            Counting {
                runs: runs.clone(),
                panic_on: 2,
            },
            shutdown.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while runs.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_stuck_cycle() {
        let shutdown = ShutdownSignal::new();
        let handle = tokio::spawn(drive(Stuck, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_during_sleep_exits_without_a_cycle() {
        let runs = Arc::new(AtomicU32::new(0));
        let shutdown = ShutdownSignal::new();
        shutdown.trigger();
        drive(
            Counting {
                runs: runs.clone(),
                panic_on: 0,
            },
            shutdown,
        )
        .await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
