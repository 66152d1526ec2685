//! Daemon configuration
//!
//! Built once at boot: defaults, then an optional JSON file, then environment
//! variables. Shared read-only as `Arc<BridgeConfig>` afterwards.

use bridge_push::{RetryPolicy, StoreTables};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};

/// Configuration for the bridge daemon.
#[derive(Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Interface to listen on
    #[serde(default = "default_host")]
    pub host: String,

    /// First port to try
    #[serde(default = "default_port")]
    pub port: u16,

    /// Extra consecutive ports to try when the first is taken
    #[serde(default = "default_port_fallbacks")]
    pub port_fallback_attempts: u16,

    /// Shared secret for every route except /health. Empty denies all.
    #[serde(default)]
    pub auth_secret: String,

    /// Identifier used as the state-store primary key
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// Notification topic URL (ntfy-style). Alerts are dropped when unset.
    #[serde(default)]
    pub ntfy_url: Option<String>,

    /// State-store base URL (PostgREST-compatible)
    #[serde(default)]
    pub state_store_url: Option<String>,

    /// State-store API key, sent as `apikey` and bearer token
    #[serde(default)]
    pub state_store_key: Option<String>,

    #[serde(default = "default_state_table")]
    pub state_table: String,

    #[serde(default = "default_heartbeat_table")]
    pub heartbeat_table: String,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_state_push_interval")]
    pub state_push_interval_secs: u64,

    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    /// Consecutive failures before a loop escalates
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// Delays between push attempts, in seconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: Vec<u64>,

    /// Per-attempt timeout for outbound pushes
    #[serde(default = "default_push_timeout")]
    pub push_timeout_secs: u64,

    /// Local health URL polled by the watchdog. Defaults to our own /health.
    #[serde(default)]
    pub health_url: Option<String>,

    /// Public (tunnelled) health URL polled by the watchdog
    #[serde(default)]
    pub public_health_url: Option<String>,

    /// `pgrep -f` pattern that must match a running process
    #[serde(default)]
    pub watch_process: Option<String>,

    /// Shell command run when the watchdog escalates (e.g. `pm2 restart tcc-tunnel`)
    #[serde(default)]
    pub restart_command: Option<String>,

    #[serde(default = "default_restart_cooldown")]
    pub restart_cooldown_secs: u64,

    #[serde(default = "default_true")]
    pub deny_list_enabled: bool,

    /// Extra deny-list substrings on top of the built-in set
    #[serde(default)]
    pub deny_extra: Vec<String>,

    /// `/write_file` refuses paths outside this directory
    #[serde(default = "default_write_root")]
    pub write_root: PathBuf,

    /// Where `/listen` recordings are written
    #[serde(default = "default_record_dir")]
    pub record_dir: PathBuf,

    /// Mount point reported as device storage
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,

    /// Upper bound on a caller-supplied exec timeout
    #[serde(default = "default_exec_max_timeout")]
    pub exec_max_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_port_fallbacks() -> u16 {
    5
}

fn default_device_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "bridge".to_string())
}

fn default_state_table() -> String {
    StoreTables::default().state
}

fn default_heartbeat_table() -> String {
    StoreTables::default().heartbeat
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_state_push_interval() -> u64 {
    300
}

fn default_watchdog_interval() -> u64 {
    60
}

fn default_fail_threshold() -> u32 {
    bridge_watch::DEFAULT_FAIL_THRESHOLD
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_backoff() -> Vec<u64> {
    vec![2, 4, 8, 16, 32]
}

fn default_push_timeout() -> u64 {
    15
}

fn default_restart_cooldown() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_write_root() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_record_dir() -> PathBuf {
    std::env::temp_dir().join("bridged")
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/")
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_exec_max_timeout() -> u64 {
    300
}

impl BridgeConfig {
    pub fn load(path: &Path) -> BridgeResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| BridgeError::Config(format!("parse {}: {e}", path.display())))
    }

    /// Load `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: Option<&Path>) -> BridgeResult<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> BridgeResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> BridgeResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> BridgeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("BRIDGE_HOST") {
            self.host = v;
        }
        if let Some(v) = get("BRIDGE_PORT") {
            self.port = parse_env("BRIDGE_PORT", &v)?;
        }
        if let Some(v) = get("BRIDGE_PORT_FALLBACKS") {
            self.port_fallback_attempts = parse_env("BRIDGE_PORT_FALLBACKS", &v)?;
        }
        if let Some(v) = get("BRIDGE_AUTH") {
            self.auth_secret = v;
        }
        if let Some(v) = get("DEVICE_ID") {
            self.device_id = v;
        }
        if let Some(v) = get("NTFY_URL") {
            self.ntfy_url = Some(v);
        }
        if let Some(v) = get("STATE_STORE_URL") {
            self.state_store_url = Some(v);
        }
        if let Some(v) = get("STATE_STORE_KEY") {
            self.state_store_key = Some(v);
        }
        if let Some(v) = get("STATE_TABLE") {
            self.state_table = v;
        }
        if let Some(v) = get("HEARTBEAT_TABLE") {
            self.heartbeat_table = v;
        }
        if let Some(v) = get("HEARTBEAT_INTERVAL_SECS") {
            self.heartbeat_interval_secs = parse_env("HEARTBEAT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("STATE_PUSH_INTERVAL_SECS") {
            self.state_push_interval_secs = parse_env("STATE_PUSH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("WATCHDOG_INTERVAL_SECS") {
            self.watchdog_interval_secs = parse_env("WATCHDOG_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("FAIL_THRESHOLD") {
            self.fail_threshold = parse_env("FAIL_THRESHOLD", &v)?;
        }
        if let Some(v) = get("RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = parse_env("RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("RETRY_BACKOFF_SECS") {
            self.retry_backoff_secs = split_list(&v)
                .map(|s| parse_env("RETRY_BACKOFF_SECS", &s))
                .collect::<BridgeResult<Vec<u64>>>()?;
        }
        if let Some(v) = get("PUSH_TIMEOUT_SECS") {
            self.push_timeout_secs = parse_env("PUSH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("HEALTH_URL") {
            self.health_url = Some(v);
        }
        if let Some(v) = get("PUBLIC_HEALTH_URL") {
            self.public_health_url = Some(v);
        }
        if let Some(v) = get("WATCH_PROCESS") {
            self.watch_process = Some(v);
        }
        if let Some(v) = get("RESTART_COMMAND") {
            self.restart_command = Some(v);
        }
        if let Some(v) = get("RESTART_COOLDOWN_SECS") {
            self.restart_cooldown_secs = parse_env("RESTART_COOLDOWN_SECS", &v)?;
        }
        if let Some(v) = get("DENY_LIST") {
            let v = v.to_ascii_lowercase();
            self.deny_list_enabled = !matches!(v.as_str(), "off" | "false" | "0" | "no");
        }
        if let Some(v) = get("DENY_EXTRA") {
            self.deny_extra = split_list(&v).collect();
        }
        if let Some(v) = get("WRITE_ROOT") {
            self.write_root = PathBuf::from(v);
        }
        if let Some(v) = get("RECORD_DIR") {
            self.record_dir = PathBuf::from(v);
        }
        if let Some(v) = get("STORAGE_PATH") {
            self.storage_path = PathBuf::from(v);
        }
        if let Some(v) = get("EXEC_TIMEOUT_SECS") {
            self.exec_timeout_secs = parse_env("EXEC_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("EXEC_MAX_TIMEOUT_SECS") {
            self.exec_max_timeout_secs = parse_env("EXEC_MAX_TIMEOUT_SECS", &v)?;
        }
        Ok(())
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> BridgeResult<()> {
        for (name, secs) in [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("state_push_interval_secs", self.state_push_interval_secs),
            ("watchdog_interval_secs", self.watchdog_interval_secs),
            ("exec_timeout_secs", self.exec_timeout_secs),
            ("push_timeout_secs", self.push_timeout_secs),
        ] {
            if secs == 0 {
                return Err(BridgeError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.exec_max_timeout_secs < self.exec_timeout_secs {
            return Err(BridgeError::Config(
                "exec_max_timeout_secs must not be below exec_timeout_secs".to_string(),
            ));
        }
        if self.fail_threshold == 0 {
            return Err(BridgeError::Config("fail_threshold must be at least 1".to_string()));
        }
        if self.device_id.trim().is_empty() {
            return Err(BridgeError::Config("device_id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_secs(self.retry_max_attempts, &self.retry_backoff_secs)
    }

    pub fn store_tables(&self) -> StoreTables {
        StoreTables {
            state: self.state_table.clone(),
            heartbeat: self.heartbeat_table.clone(),
        }
    }

    /// Base URL and key, if the state store is fully configured.
    pub fn state_store(&self) -> Option<(&str, &str)> {
        match (&self.state_store_url, &self.state_store_key) {
            (Some(url), Some(key)) => Some((url.as_str(), key.as_str())),
            _ => None,
        }
    }

    /// URL the watchdog polls for local liveness.
    /// Health URL the watchdog polls. Without an explicit `health_url` this is
    /// our own `/health` on `bound_port`, which differs from `port` when the
    /// listener fell back to a later port.
    pub fn local_health_url(&self, bound_port: u16) -> String {
        self.health_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{bound_port}/health"))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn state_push_interval(&self) -> Duration {
        Duration::from_secs(self.state_push_interval_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn exec_max_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_max_timeout_secs)
    }
}

// Credentials are redacted so the config can be logged with `?config`.
impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |set: bool| if set { "<set>" } else { "<unset>" };
        f.debug_struct("BridgeConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("port_fallback_attempts", &self.port_fallback_attempts)
            .field("auth_secret", &redact(!self.auth_secret.is_empty()))
            .field("device_id", &self.device_id)
            .field("ntfy_url", &self.ntfy_url)
            .field("state_store_url", &self.state_store_url)
            .field("state_store_key", &redact(self.state_store_key.is_some()))
            .field("state_table", &self.state_table)
            .field("heartbeat_table", &self.heartbeat_table)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .field("state_push_interval_secs", &self.state_push_interval_secs)
            .field("watchdog_interval_secs", &self.watchdog_interval_secs)
            .field("fail_threshold", &self.fail_threshold)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("retry_backoff_secs", &self.retry_backoff_secs)
            .field("push_timeout_secs", &self.push_timeout_secs)
            .field("health_url", &self.health_url)
            .field("public_health_url", &self.public_health_url)
            .field("watch_process", &self.watch_process)
            .field("restart_command", &self.restart_command)
            .field("restart_cooldown_secs", &self.restart_cooldown_secs)
            .field("deny_list_enabled", &self.deny_list_enabled)
            .field("deny_extra", &self.deny_extra)
            .field("write_root", &self.write_root)
            .field("record_dir", &self.record_dir)
            .field("storage_path", &self.storage_path)
            .field("exec_timeout_secs", &self.exec_timeout_secs)
            .field("exec_max_timeout_secs", &self.exec_max_timeout_secs)
            .finish()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> BridgeResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| BridgeError::Config(format!("{key}={value:?}: {e}")))
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            port_fallback_attempts: default_port_fallbacks(),
            auth_secret: String::new(),
            device_id: default_device_id(),
            ntfy_url: None,
            state_store_url: None,
            state_store_key: None,
            state_table: default_state_table(),
            heartbeat_table: default_heartbeat_table(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            state_push_interval_secs: default_state_push_interval(),
            watchdog_interval_secs: default_watchdog_interval(),
            fail_threshold: default_fail_threshold(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_secs: default_retry_backoff(),
            push_timeout_secs: default_push_timeout(),
            health_url: None,
            public_health_url: None,
            watch_process: None,
            restart_command: None,
            restart_cooldown_secs: default_restart_cooldown(),
            deny_list_enabled: true,
            deny_extra: Vec::new(),
            write_root: default_write_root(),
            record_dir: default_record_dir(),
            storage_path: default_storage_path(),
            exec_timeout_secs: default_exec_timeout(),
            exec_max_timeout_secs: default_exec_max_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn defaults_have_no_credentials() {
        let c = BridgeConfig::default();
        assert!(c.auth_secret.is_empty());
        assert!(c.state_store_key.is_none());
        assert!(c.ntfy_url.is_none());
        assert_eq!(c.port, 8080);
        assert_eq!(c.port_fallback_attempts, 5);
        assert!(c.deny_list_enabled);
        c.validate().unwrap();
    }

    #[test]
    fn env_overrides_defaults() {
        let mut c = BridgeConfig::default();
        c.apply_env_from(env(&[
            ("BRIDGE_PORT", "9191"),
            ("BRIDGE_AUTH", "s3cret"),
            ("RETRY_BACKOFF_SECS", "1, 2 ,3"),
            ("DENY_LIST", "off"),
            ("DENY_EXTRA", "curl,wget"),
            ("STATE_STORE_URL", "https://db.example.test"),
            ("STATE_STORE_KEY", "k"),
        ]))
        .unwrap();

        assert_eq!(c.port, 9191);
        assert_eq!(c.auth_secret, "s3cret");
        assert_eq!(c.retry_backoff_secs, vec![1, 2, 3]);
        assert!(!c.deny_list_enabled);
        assert_eq!(c.deny_extra, vec!["curl", "wget"]);
        assert_eq!(c.state_store(), Some(("https://db.example.test", "k")));
        assert_eq!(c.local_health_url(9193), "http://127.0.0.1:9193/health");
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut c = BridgeConfig::default();
        c.apply_env_from(env(&[("BRIDGE_PORT", "  "), ("NTFY_URL", "")])).unwrap();
        assert_eq!(c.port, 8080);
        assert!(c.ntfy_url.is_none());
    }

    #[test]
    fn bad_number_is_config_error() {
        let mut c = BridgeConfig::default();
        let err = c.apply_env_from(env(&[("FAIL_THRESHOLD", "three")])).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)), "{err}");
        assert!(err.to_string().contains("FAIL_THRESHOLD"));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let c = BridgeConfig {
            watchdog_interval_secs: 0,
            ..BridgeConfig::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: BridgeConfig =
            serde_json::from_str(r#"{"port": 7000, "device_id": "tab"}"#).unwrap();
        assert_eq!(c.port, 7000);
        assert_eq!(c.device_id, "tab");
        assert_eq!(c.restart_cooldown_secs, 120);
        assert_eq!(c.retry_policy().effective_attempts(), 5);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let c = BridgeConfig {
            restart_command: Some("pm2 restart tcc-tunnel".to_string()),
            ..BridgeConfig::default()
        };
        c.save(&path).unwrap();
        let back = BridgeConfig::load(&path).unwrap();
        assert_eq!(back.restart_command.as_deref(), Some("pm2 restart tcc-tunnel"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = BridgeConfig::load_or_default(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(c.port, 8080);
    }

    #[test]
    fn debug_redacts_credentials() {
        let c = BridgeConfig {
            auth_secret: "hunter2".to_string(),
            state_store_key: Some("service-role".to_string()),
            ..BridgeConfig::default()
        };
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("service-role"));
    }
}
