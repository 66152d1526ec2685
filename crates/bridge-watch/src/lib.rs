//! Failure bookkeeping and escalation policy for the background monitors.
//!
//! Each loop owns one [`FailureTracker`]. The tracker is pure: it records
//! outcomes and answers with an [`Escalation`] telling the loop what to send.
//! Alerts are edge-triggered:
//! - one alert when the consecutive-failure counter reaches the threshold
//! - one recovery notice on the first success after that alert
//! - nothing in between, however long the outage lasts
//!
//! A loop with a corrective action may zero the counter after acting. Reaching
//! the threshold again within the same episode asks for another action but
//! sends no second alert.

#![forbid(unsafe_code)]

use bridge_proto::{Alert, Severity};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ─── Policy ───────────────────────────────────────────────────────────────────

/// Default consecutive failures before a loop escalates.
pub const DEFAULT_FAIL_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Consecutive failures that trigger the alert.
    pub fail_threshold: u32,
    /// Severity of the outage alert.
    pub alert_severity: Severity,
}

impl EscalationPolicy {
    pub fn new(fail_threshold: u32, alert_severity: Severity) -> Self {
        Self {
            fail_threshold: fail_threshold.max(1),
            alert_severity,
        }
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FAIL_THRESHOLD, Severity::High)
    }
}

// ─── Loop phases ──────────────────────────────────────────────────────────────

/// Where a background loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Sleeping,
    Collecting,
    Reporting,
    Escalating,
    Terminated,
}

impl LoopPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sleeping => write!(f, "sleeping"),
            Self::Collecting => write!(f, "collecting"),
            Self::Reporting => write!(f, "reporting"),
            Self::Escalating => write!(f, "escalating"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Phase holder for one loop. Once terminated it stays terminated.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    loop_name: &'static str,
    phase: LoopPhase,
}

impl PhaseTracker {
    pub fn new(loop_name: &'static str) -> Self {
        Self {
            loop_name,
            phase: LoopPhase::Sleeping,
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Move to `next`. Returns false (and stays put) if already terminated.
    pub fn enter(&mut self, next: LoopPhase) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        if self.phase != next {
            debug!(loop_name = self.loop_name, from = %self.phase, to = %next, "loop phase");
        }
        self.phase = next;
        true
    }
}

// ─── Outcome tracking ─────────────────────────────────────────────────────────

/// Bookkeeping for the most recent attempt of one loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    /// Attempts spent by the most recent push.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// An outage alert has fired and no recovery has been sent yet.
    pub alerted: bool,
    /// Result of the previous cycle, `None` before the first.
    pub last_ok: Option<bool>,
}

/// What the loop must do after recording an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    /// Nothing to send.
    None,
    /// Failing, below threshold or already alerted.
    StillFailing { failures: u32 },
    /// Threshold just reached: send the outage alert (and restart, for the watchdog).
    Alert { failures: u32 },
    /// Threshold reached again after a corrective action, same episode: act
    /// again, but the alert has already gone out.
    Retry { failures: u32 },
    /// First success after an alert: send the recovery notice.
    Recovered { after_failures: u32 },
}

impl Escalation {
    pub fn is_alert(&self) -> bool {
        matches!(self, Self::Alert { .. })
    }

    /// Whether a loop with a corrective action should take it now.
    pub fn needs_action(&self) -> bool {
        matches!(self, Self::Alert { .. } | Self::Retry { .. })
    }
}

/// Counts consecutive failures for one loop and decides when to escalate.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    loop_name: &'static str,
    policy: EscalationPolicy,
    outcome: PushOutcome,
}

impl FailureTracker {
    pub fn new(loop_name: &'static str, policy: EscalationPolicy) -> Self {
        Self {
            loop_name,
            policy,
            outcome: PushOutcome::default(),
        }
    }

    pub fn loop_name(&self) -> &'static str {
        self.loop_name
    }

    pub fn outcome(&self) -> &PushOutcome {
        &self.outcome
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    pub fn record_success(&mut self, attempts: u32) -> Escalation {
        let failures = self.outcome.consecutive_failures;
        let was_alerted = self.outcome.alerted;

        self.outcome.attempts = attempts;
        self.outcome.last_error = None;
        self.outcome.consecutive_failures = 0;
        self.outcome.alerted = false;
        self.outcome.last_ok = Some(true);

        if was_alerted {
            info!(loop_name = self.loop_name, after_failures = failures, "recovered");
            Escalation::Recovered {
                after_failures: failures,
            }
        } else {
            Escalation::None
        }
    }

    pub fn record_failure(&mut self, attempts: u32, error: impl Into<String>) -> Escalation {
        let error = error.into();
        self.outcome.attempts = attempts;
        self.outcome.consecutive_failures = self.outcome.consecutive_failures.saturating_add(1);
        self.outcome.last_ok = Some(false);
        let failures = self.outcome.consecutive_failures;

        warn!(
            loop_name = self.loop_name,
            failures,
            threshold = self.policy.fail_threshold,
            error = %error,
            "check failed"
        );
        self.outcome.last_error = Some(error);

        if failures != self.policy.fail_threshold {
            Escalation::StillFailing { failures }
        } else if self.outcome.alerted {
            Escalation::Retry { failures }
        } else {
            self.outcome.alerted = true;
            Escalation::Alert { failures }
        }
    }

    /// Zero the counter after a corrective action so a persisting outage
    /// reaches the threshold again. The alert flag is kept: the next threshold
    /// yields [`Escalation::Retry`], and the eventual success still produces a
    /// recovery notice.
    pub fn reset_after_action(&mut self) {
        debug!(loop_name = self.loop_name, "failure counter reset after corrective action");
        self.outcome.consecutive_failures = 0;
    }

    /// Render the alert for `escalation`, if it calls for one.
    pub fn alert_for(
        &self,
        escalation: &Escalation,
        device_id: &str,
        subject: &str,
    ) -> Option<Alert> {
        let loop_name = self.loop_name;
        match escalation {
            Escalation::Alert { failures } => {
                let detail = self.outcome.last_error.as_deref().unwrap_or("no detail");
                let message =
                    format!("{failures} consecutive failures ({loop_name}). Last error: {detail}");
                Some(
                    Alert::new(
                        format!("{device_id}: {subject} DOWN"),
                        message,
                        self.policy.alert_severity,
                    )
                    .with_tags(["warning", loop_name]),
                )
            }
            Escalation::Recovered { after_failures } => Some(
                Alert::new(
                    format!("{device_id}: {subject} RESTORED"),
                    format!("back online after {after_failures} failures ({loop_name})"),
                    Severity::Default,
                )
                .with_tags(["white_check_mark", loop_name]),
            ),
            Escalation::None | Escalation::StillFailing { .. } | Escalation::Retry { .. } => None,
        }
    }
}

// ─── Check reports ────────────────────────────────────────────────────────────

/// One named liveness check and its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub ok: bool,
    pub detail: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: true,
            detail: None,
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// All checks from one watchdog cycle. Healthy only if every check passed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub checks: Vec<CheckResult>,
}

impl CheckReport {
    pub fn push(&mut self, result: CheckResult) {
        self.checks.push(result);
    }

    pub fn all_ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }

    /// `name: detail` for every failed check, joined with `; `.
    pub fn failure_summary(&self) -> String {
        self.checks
            .iter()
            .filter(|c| !c.ok)
            .map(|c| format!("{}: {}", c.name, c.detail.as_deref().unwrap_or("failed")))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
