//! Device probes.
//!
//! Each probe shells out through the [`CommandRunner`] and parses the output.
//! Anything that fails (missing binary, timeout, bad output) yields the
//! sentinel for that field, so [`DeviceProbe::collect`] always returns a
//! complete [`DeviceState`].

use bridge_proto::{Battery, DeviceState, Storage, UNKNOWN_INT, UNKNOWN_TEXT};
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::debug;

use crate::executor::{CommandRunner, CommandSpec};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct DeviceProbe {
    runner: Arc<dyn CommandRunner>,
    device_id: String,
    version: String,
    storage_path: PathBuf,
    started_at: Instant,
}

impl DeviceProbe {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        device_id: impl Into<String>,
        storage_path: PathBuf,
        started_at: Instant,
    ) -> Self {
        Self {
            runner,
            device_id: device_id.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            storage_path,
            started_at,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Full snapshot. `last_push_ok` is carried through untouched.
    pub async fn collect(&self, last_push_ok: Option<bool>) -> DeviceState {
        let (battery, network, storage) =
            tokio::join!(self.battery(), self.network(), self.storage());

        let uptime = self.uptime().as_secs();
        let mut state = DeviceState::unknown(&self.device_id, &self.version, uptime)
            .with_battery(battery)
            .with_network(network)
            .with_storage(storage);
        state.device_uptime_secs = device_uptime();
        state.timestamp = Utc::now();
        state.last_push_ok = last_push_ok;
        state
    }

    pub async fn battery(&self) -> Battery {
        self.run_json(&["termux-battery-status"])
            .await
            .and_then(|v| parse_battery(&v))
            .unwrap_or_else(Battery::unknown)
    }

    /// `wifi:<ssid>`, `cell:<operator>`, or the sentinel.
    pub async fn network(&self) -> String {
        if let Some(ssid) = self
            .run_json(&["termux-wifi-connectioninfo"])
            .await
            .and_then(|v| parse_wifi(&v))
        {
            return format!("wifi:{ssid}");
        }
        if let Some(op) = self
            .run_json(&["termux-telephony-deviceinfo"])
            .await
            .and_then(|v| parse_cell(&v))
        {
            return format!("cell:{op}");
        }
        UNKNOWN_TEXT.to_string()
    }

    pub async fn storage(&self) -> Storage {
        let path = self.storage_path.to_string_lossy().to_string();
        let out = self
            .runner
            .run(&CommandSpec::argv(["df", "-k", path.as_str()]), PROBE_TIMEOUT)
            .await;
        if !out.success() {
            debug!(path, stderr = %out.stderr.trim(), "df probe failed");
            return Storage::unknown();
        }
        parse_df(&out.stdout).unwrap_or_else(Storage::unknown)
    }

    async fn run_json(&self, argv: &[&str]) -> Option<Value> {
        let out = self.runner.run(&CommandSpec::argv(argv.iter().copied()), PROBE_TIMEOUT).await;
        if !out.success() {
            debug!(
                probe = argv.first().copied().unwrap_or_default(),
                returncode = out.returncode,
                "probe failed"
            );
            return None;
        }
        serde_json::from_str(out.stdout.trim()).ok()
    }
}

/// OS uptime in seconds, or the sentinel when unavailable.
pub fn device_uptime() -> i64 {
    match System::uptime() {
        0 => UNKNOWN_INT,
        secs => i64::try_from(secs).unwrap_or(UNKNOWN_INT),
    }
}

// ─── Parsers ──────────────────────────────────────────────────────────────────

/// `termux-battery-status` output: `{"percentage": 81, "status": "CHARGING", ...}`.
pub fn parse_battery(v: &Value) -> Option<Battery> {
    let pct = v.get("percentage")?.as_f64()?;
    if !(0.0..=100.0).contains(&pct) {
        return None;
    }
    let status = v
        .get("status")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_TEXT)
        .to_uppercase();
    Some(Battery {
        pct: pct.round() as i64,
        status,
    })
}

/// `termux-wifi-connectioninfo` output. Disconnected radios report `<unknown ssid>`.
pub fn parse_wifi(v: &Value) -> Option<String> {
    let ssid = v.get("ssid")?.as_str()?.trim().trim_matches('"');
    if ssid.is_empty() || ssid.eq_ignore_ascii_case("<unknown ssid>") {
        return None;
    }
    if let Some(state) = v.get("supplicant_state").and_then(Value::as_str)
        && state != "COMPLETED"
    {
        return None;
    }
    Some(ssid.to_string())
}

/// `termux-telephony-deviceinfo` output.
pub fn parse_cell(v: &Value) -> Option<String> {
    if v.get("data_state").and_then(Value::as_str) == Some("disconnected") {
        return None;
    }
    v.get("network_operator_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `df -k <path>` output. Handles the filesystem name wrapping onto its own line.
pub fn parse_df(out: &str) -> Option<Storage> {
    let tokens: Vec<&str> = out.lines().skip(1).flat_map(str::split_whitespace).collect();
    let (used_kb, avail_kb) = tokens.windows(3).find_map(|w| {
        let total = w[0].parse::<u64>().ok()?;
        let used = w[1].parse::<u64>().ok()?;
        let avail = w[2].parse::<u64>().ok()?;
        (total > 0).then_some((used, avail))
    })?;

    let denom = used_kb + avail_kb;
    let used_pct = if denom == 0 {
        0.0
    } else {
        (used_kb as f64 / denom as f64 * 1000.0).round() / 10.0
    };
    Some(Storage {
        used_pct,
        free_mb: i64::try_from(avail_kb / 1024).ok()?,
    })
}
