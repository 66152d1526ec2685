//! Wire and data types for the device bridge.
//!
//! Defines the records pushed to the external state store, the alerts sent to
//! the notification topic, and the JSON bodies returned by the HTTP surface.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Integer sentinel used when a numeric probe fails.
pub const UNKNOWN_INT: i64 = -1;

/// Text sentinel used when a string probe fails.
pub const UNKNOWN_TEXT: &str = "UNKNOWN";

// ─── Severity ─────────────────────────────────────────────────────────────────

/// Alert severity. Closed set, mapped onto the notification service priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Default,
    High,
    Urgent,
}

impl Severity {
    /// Numeric priority understood by ntfy-style topics (2..=5).
    pub fn priority(self) -> u8 {
        match self {
            Self::Low => 2,
            Self::Default => 3,
            Self::High => 4,
            Self::Urgent => 5,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Default => write!(f, "default"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

// ─── Alerts ───────────────────────────────────────────────────────────────────

/// A human-readable alert destined for the notification topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub tags: Vec<String>,
}

impl Alert {
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Body POSTed to the topic URL.
    pub fn to_payload(&self) -> NotifyPayload<'_> {
        NotifyPayload {
            title: &self.title,
            message: &self.message,
            priority: self.severity.priority(),
            tags: &self.tags,
        }
    }
}

/// JSON wire form of an [`Alert`].
#[derive(Debug, Serialize)]
pub struct NotifyPayload<'a> {
    pub title: &'a str,
    pub message: &'a str,
    pub priority: u8,
    pub tags: &'a [String],
}

// ─── Device state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub pct: i64,
    pub status: String,
}

impl Battery {
    pub fn unknown() -> Self {
        Self {
            pct: UNKNOWN_INT,
            status: UNKNOWN_TEXT.to_string(),
        }
    }

    pub fn is_known(&self) -> bool {
        self.pct != UNKNOWN_INT
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Storage {
    pub used_pct: f64,
    pub free_mb: i64,
}

impl Storage {
    pub fn unknown() -> Self {
        Self {
            used_pct: UNKNOWN_INT as f64,
            free_mb: UNKNOWN_INT,
        }
    }
}

/// Snapshot of the device, recomputed on every report cycle.
///
/// Every field carries a sentinel when its probe fails, so a record is always
/// complete when it leaves the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub battery_pct: i64,
    pub battery_status: String,
    pub network: String,
    pub storage_used_pct: f64,
    pub storage_free_mb: i64,
    pub uptime_secs: u64,
    pub device_uptime_secs: i64,
    pub version: String,
    /// Outcome of the previous push from the same loop. `None` before the
    /// first, in which case the key is left out of the row entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push_ok: Option<bool>,
}

impl DeviceState {
    /// A state with every probed field set to its sentinel.
    pub fn unknown(
        device_id: impl Into<String>,
        version: impl Into<String>,
        uptime_secs: u64,
    ) -> Self {
        let battery = Battery::unknown();
        let storage = Storage::unknown();
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            battery_pct: battery.pct,
            battery_status: battery.status,
            network: UNKNOWN_TEXT.to_string(),
            storage_used_pct: storage.used_pct,
            storage_free_mb: storage.free_mb,
            uptime_secs,
            device_uptime_secs: UNKNOWN_INT,
            version: version.into(),
            last_push_ok: None,
        }
    }

    pub fn with_battery(mut self, battery: Battery) -> Self {
        self.battery_pct = battery.pct;
        self.battery_status = battery.status;
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage_used_pct = storage.used_pct;
        self.storage_free_mb = storage.free_mb;
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn battery(&self) -> Battery {
        Battery {
            pct: self.battery_pct,
            status: self.battery_status.clone(),
        }
    }
}

/// Lightweight liveness row written by the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub device_id: String,
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub last_seen: DateTime<Utc>,
}

impl Heartbeat {
    pub fn online(
        device_id: impl Into<String>,
        version: impl Into<String>,
        uptime_secs: u64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            status: "online".to_string(),
            version: version.into(),
            uptime_secs,
            last_seen: Utc::now(),
        }
    }
}

// ─── Command results ──────────────────────────────────────────────────────────

/// Result of one `/exec` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
}

impl CommandResult {
    /// The command ran past its timeout and was killed.
    pub const TIMEOUT: i32 = -1;
    /// The command matched the deny-list and was never spawned.
    pub const DENIED: i32 = -2;
    /// The command could not be spawned or awaited.
    pub const INTERNAL: i32 = -3;

    pub fn completed(stdout: String, stderr: String, returncode: i32) -> Self {
        Self {
            stdout,
            stderr,
            returncode,
        }
    }

    pub fn timed_out(after_secs: f64) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("timed out after {after_secs}s"),
            returncode: Self::TIMEOUT,
        }
    }

    pub fn denied(pattern: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("command rejected by deny-list: matched '{pattern}'"),
            returncode: Self::DENIED,
        }
    }

    pub fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("internal error: {error}"),
            returncode: Self::INTERNAL,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.returncode == Self::TIMEOUT
    }

    pub fn is_denied(&self) -> bool {
        self.returncode == Self::DENIED
    }

    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

// ─── HTTP bodies ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Seconds since process start.
    pub uptime: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResponse {
    pub ok: bool,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

/// Every error response carries this body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
