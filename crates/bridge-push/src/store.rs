//! PostgREST-style state store client.
//!
//! Rows are upserted keyed by `device_id`, so the store holds one row per
//! device per table. Sentinel values are sent as-is; nothing is ever `null`.

use crate::retry::{PushError, PushResult, RetryingHttpClient};
use async_trait::async_trait;
use bridge_proto::{DeviceState, Heartbeat};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tracing::{debug, warn};

const PREFER_UPSERT: &str = "resolution=merge-duplicates,return=minimal";

/// Where the monitors send their rows. `Ok` carries the number of calls the
/// upsert took; the error keeps the last attempt's detail for alerts.
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn upsert_state(&self, state: &DeviceState) -> PushResult<u32>;
    async fn upsert_heartbeat(&self, heartbeat: &Heartbeat) -> PushResult<u32>;
}

/// Table names used by the store client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTables {
    pub state: String,
    pub heartbeat: String,
}

impl Default for StoreTables {
    fn default() -> Self {
        Self {
            state: "device_state".to_string(),
            heartbeat: "device_heartbeat".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    client: RetryingHttpClient,
    base_url: String,
    api_key: String,
    tables: StoreTables,
}

impl StateStore {
    pub fn new(
        client: RetryingHttpClient,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        tables: StoreTables,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            tables,
        }
    }

    pub fn endpoint(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}?on_conflict=device_id", self.base_url)
    }

    fn headers(&self) -> PushResult<HeaderMap> {
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| PushError::Request("API key is not a valid header value".to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| PushError::Request("API key is not a valid header value".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("apikey"), key);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(HeaderName::from_static("prefer"), HeaderValue::from_static(PREFER_UPSERT));
        Ok(headers)
    }

    /// Upsert a single row into `table`. Returns the calls it took.
    pub async fn upsert<T: Serialize + Sync>(&self, table: &str, row: &T) -> PushResult<u32> {
        let url = self.endpoint(table);
        let delivered = self.client.post_json(&url, row, self.headers()?).await?;
        debug!(table, attempts = delivered.attempts, "row upserted");
        Ok(delivered.attempts)
    }
}

#[async_trait]
impl StateSink for StateStore {
    async fn upsert_state(&self, state: &DeviceState) -> PushResult<u32> {
        self.upsert(&self.tables.state, state).await.inspect_err(|e| {
            warn!(device_id = %state.device_id, error = %e, "state upsert failed");
        })
    }

    async fn upsert_heartbeat(&self, heartbeat: &Heartbeat) -> PushResult<u32> {
        self.upsert(&self.tables.heartbeat, heartbeat).await.inspect_err(|e| {
            warn!(device_id = %heartbeat.device_id, error = %e, "heartbeat upsert failed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::testutil;
    use axum::{
        Json, Router,
        extract::{Path, Query, State},
        http::StatusCode,
        routing::post,
    };
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// table -> device_id -> row
    type Tables = Arc<Mutex<HashMap<String, HashMap<String, Value>>>>;

    async fn fake_postgrest(expected_key: &'static str) -> (String, Tables) {
        let tables: Tables = Arc::default();
        let app = Router::new()
            .route(
                "/rest/v1/{table}",
                post(
                    move |State(tables): State<Tables>,
                          Path(table): Path<String>,
                          Query(q): Query<HashMap<String, String>>,
                          headers: axum::http::HeaderMap,
                          Json(row): Json<Value>| async move {
                        let header = |name: &str| {
                            headers
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or_default()
                                .to_string()
                        };
                        if header("apikey") != expected_key
                            || header("authorization") != format!("Bearer {expected_key}")
                        {
                            return StatusCode::UNAUTHORIZED;
                        }
                        if q.get("on_conflict").map(String::as_str) != Some("device_id")
                            || !header("prefer").contains("merge-duplicates")
                        {
                            return StatusCode::CONFLICT;
                        }
                        let Some(id) = row["device_id"].as_str().map(str::to_string) else {
                            return StatusCode::BAD_REQUEST;
                        };
                        tables.lock().unwrap().entry(table).or_default().insert(id, row);
                        StatusCode::CREATED
                    },
                ),
            )
            .with_state(tables.clone());
        let addr = testutil::serve(app).await;
        (format!("http://{addr}/"), tables)
    }

    fn store(base: String, key: &str) -> StateStore {
        let policy = RetryPolicy::new(2, vec![Duration::from_millis(5)]);
        let client = RetryingHttpClient::new(policy, Duration::from_secs(2)).unwrap();
        StateStore::new(client, base, key, StoreTables::default())
    }

    #[test]
    fn endpoint_targets_on_conflict_device_id() {
        let s = store("https://db.example.test/".to_string(), "k");
        assert_eq!(
            s.endpoint("device_state"),
            "https://db.example.test/rest/v1/device_state?on_conflict=device_id"
        );
    }

    #[tokio::test]
    async fn repeated_upserts_overwrite_one_row() {
        let (base, tables) = fake_postgrest("secret-key").await;
        let s = store(base, "secret-key");

        let mut state = DeviceState::unknown("phone-1", "1.0.0", 10);
        assert_eq!(s.upsert_state(&state).await.unwrap(), 1);
        state.battery_pct = 55;
        assert!(s.upsert_state(&state).await.is_ok());

        let tables = tables.lock().unwrap();
        let rows = &tables["device_state"];
        assert_eq!(rows.len(), 1, "same device id must not accumulate rows");
        assert_eq!(rows["phone-1"]["battery_pct"], 55);
        assert_eq!(rows["phone-1"]["network"], "UNKNOWN");
    }

    #[tokio::test]
    async fn heartbeat_goes_to_its_own_table() {
        let (base, tables) = fake_postgrest("k").await;
        let s = store(base, "k");
        let beat = Heartbeat::online("phone-1", "1.0.0", 3);
        assert!(s.upsert_heartbeat(&beat).await.is_ok());

        let tables = tables.lock().unwrap();
        assert_eq!(tables["device_heartbeat"]["phone-1"]["status"], "online");
        assert!(!tables.contains_key("device_state"));
    }

    #[tokio::test]
    async fn rejected_credentials_report_failure() {
        let (base, tables) = fake_postgrest("right").await;
        let s = store(base, "wrong");
        let err = s.upsert_state(&DeviceState::unknown("phone-1", "1.0.0", 0)).await.unwrap_err();
        assert_eq!(err.attempts(), 2);
        assert!(matches!(err.last(), PushError::Status { status: 401, .. }), "{err}");
        assert!(tables.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_key_is_a_request_error() {
        let s = store("http://127.0.0.1:9".to_string(), "bad\nkey");
        let row = serde_json::json!({"device_id": "x"});
        let err = s.upsert("device_state", &row).await.unwrap_err();
        assert!(matches!(err, PushError::Request(_)), "{err}");
    }
}
