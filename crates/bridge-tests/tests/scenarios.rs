//! End-to-end scenarios across the bridge crates.
//!
//! - State upserts surviving a flaky store
//! - A full outage episode: alert at threshold, recovery notice, one each
//! - The HTTP surface served on a real socket with the real shell runner
//! - Shutdown reaching every spawned monitor

use async_trait::async_trait;
use bridge_proto::{CommandResult, DeviceState};
use bridge_push::{
    DisabledNotifier, Notifier, RetryPolicy, RetryingHttpClient, StateSink, StateStore, StoreTables,
};
use bridge_tests::{RecordingServer, dead_addr};
use bridge_watch::PhaseTracker;
use bridged::executor::{CommandRunner, CommandSpec, ShellRunner};
use bridged::loops::{self, MonitorLoop, ReporterLoop};
use bridged::{BridgeConfig, BridgeContext, ShutdownSignal, http};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Every probe fails, so snapshots are all sentinels.
struct NoTermux;

#[async_trait]
impl CommandRunner for NoTermux {
    async fn run(&self, spec: &CommandSpec, _timeout: Duration) -> CommandResult {
        CommandResult::internal(format!("{}: not found", spec.display()))
    }
}

fn store_at(base: &str, policy: RetryPolicy) -> StateStore {
    let client = RetryingHttpClient::new(policy, Duration::from_secs(2)).unwrap();
    StateStore::new(client, base, "anon-key", StoreTables::default())
}

// ─── Store ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn state_upsert_survives_transient_store_outage() {
    let server = RecordingServer::start().await;
    server.fail_next(2);
    let store = store_at(&server.base_url(), RetryPolicy::new(5, vec![ms(20), ms(40)]));

    let attempts = store.upsert_state(&DeviceState::unknown("phone-1", "0.1.0", 42)).await.unwrap();
    assert_eq!(attempts, 3);

    let reqs = server.requests();
    assert_eq!(reqs.len(), 3);
    let last = &reqs[2];
    assert_eq!(last.method, "POST");
    assert_eq!(last.path_and_query, "/rest/v1/device_state?on_conflict=device_id");
    assert_eq!(last.header("apikey"), Some("anon-key"));
    assert_eq!(last.header("authorization"), Some("Bearer anon-key"));
    assert_eq!(last.header("prefer"), Some("resolution=merge-duplicates,return=minimal"));
    assert_eq!(last.body["device_id"], "phone-1");
    assert_eq!(last.body["battery_pct"], -1);
    assert_eq!(last.body["battery_status"], "UNKNOWN");
    assert_eq!(last.body["storage_used_pct"], -1.0);
}

#[tokio::test]
async fn persistent_store_outage_stops_at_effective_attempts() {
    let server = RecordingServer::start().await;
    server.fail_next(100);
    let store = store_at(&server.base_url(), RetryPolicy::new(10, vec![ms(10), ms(10)]));

    let err = store.upsert_state(&DeviceState::unknown("phone-1", "0.1.0", 1)).await.unwrap_err();
    assert_eq!(err.attempts(), 3);
    assert_eq!(server.request_count(), 3);
}

// ─── Escalation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn outage_episode_alerts_once_and_recovers_once() {
    let store_srv = RecordingServer::start().await;
    let topic = RecordingServer::start().await;
    store_srv.fail_next(1000);

    let client = RetryingHttpClient::new(RetryPolicy::once(), Duration::from_secs(2)).unwrap();
    let store: Arc<dyn StateSink> = Arc::new(StateStore::new(
        client.clone(),
        store_srv.base_url(),
        "anon-key",
        StoreTables::default(),
    ));
    let config = BridgeConfig {
        device_id: "phone-1".to_string(),
        fail_threshold: 2,
        ..BridgeConfig::default()
    };
    let ctx = Arc::new(BridgeContext::new(
        config,
        Arc::new(NoTermux),
        Arc::new(Notifier::new(client, topic.url("/bridge-alerts"))),
        Some(store.clone()),
        ShutdownSignal::new(),
    ));
    let mut reporter = ReporterLoop::new(ctx.clone(), store);
    let mut phase = PhaseTracker::new("state_reporter");

    reporter.cycle(&mut phase).await;
    assert_eq!(topic.request_count(), 0);

    reporter.cycle(&mut phase).await;
    reporter.cycle(&mut phase).await;
    let alerts = topic.requests();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].path_and_query, "/bridge-alerts");
    assert_eq!(alerts[0].body["title"], "phone-1: state push DOWN");
    assert_eq!(alerts[0].body["priority"], 4);
    let message = alerts[0].body["message"].as_str().unwrap();
    assert!(message.contains("HTTP 503"), "{message}");
    assert!(alerts[0].body["tags"].as_array().unwrap().contains(&json!("warning")));

    store_srv.fail_next(0);
    reporter.cycle(&mut phase).await;
    reporter.cycle(&mut phase).await;
    let alerts = topic.requests();
    assert_eq!(alerts.len(), 2);
    assert_eq!(alerts[1].body["title"], "phone-1: state push RESTORED");
    assert_eq!(alerts[1].body["priority"], 3);

    let pushed: Vec<Option<Value>> = store_srv
        .requests()
        .iter()
        .map(|r| r.body.get("last_push_ok").cloned())
        .collect();
    assert_eq!(
        pushed,
        vec![
            None,
            Some(json!(false)),
            Some(json!(false)),
            Some(json!(false)),
            Some(json!(true)),
        ]
    );
}

#[tokio::test]
async fn undeliverable_alert_does_not_break_the_loop() {
    let store_srv = RecordingServer::start().await;
    store_srv.fail_next(1000);
    let client = RetryingHttpClient::new(RetryPolicy::once(), Duration::from_secs(2)).unwrap();
    let store: Arc<dyn StateSink> = Arc::new(StateStore::new(
        client.clone(),
        store_srv.base_url(),
        "anon-key",
        StoreTables::default(),
    ));
    let dead_topic = format!("http://{}/alerts", dead_addr().await);
    let config = BridgeConfig {
        fail_threshold: 1,
        ..BridgeConfig::default()
    };
    let ctx = Arc::new(BridgeContext::new(
        config,
        Arc::new(NoTermux),
        Arc::new(Notifier::new(client, dead_topic)),
        Some(store.clone()),
        ShutdownSignal::new(),
    ));
    let mut reporter = ReporterLoop::new(ctx, store);
    let mut phase = PhaseTracker::new("state_reporter");

    reporter.cycle(&mut phase).await;
    reporter.cycle(&mut phase).await;
    assert_eq!(reporter.tracker().outcome().consecutive_failures, 2);
    assert_eq!(store_srv.request_count(), 2);
}

// ─── HTTP surface ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn http_surface_over_a_real_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig {
        host: "127.0.0.1".to_string(),
        auth_secret: "s3cret".to_string(),
        device_id: "phone-1".to_string(),
        write_root: dir.path().to_path_buf(),
        record_dir: dir.path().join("rec"),
        ..BridgeConfig::default()
    };
    let shutdown = ShutdownSignal::new();
    let ctx = Arc::new(BridgeContext::new(
        config,
        Arc::new(ShellRunner),
        Arc::new(DisabledNotifier),
        None,
        shutdown.clone(),
    ));
    let listener = http::bind_with_fallback("127.0.0.1", 0, 0).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(http::serve(listener, ctx));
    let client = reqwest::Client::new();

    let health = client.get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.headers()["access-control-allow-origin"], "*");
    let body: Value = health.json().await.unwrap();
    assert_eq!(body["status"], "online");

    let resp = client
        .post(format!("http://{addr}/exec"))
        .bearer_auth("s3cret")
        .json(&json!({"command": "echo hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"stdout": "hello\n", "stderr": "", "returncode": 0}));

    let resp = client
        .post(format!("http://{addr}/exec"))
        .json(&json!({"auth": "s3cret", "cmd": "sleep 5", "timeout": 0.2}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["returncode"], -1);
    assert_eq!(body["stdout"], "");

    let resp = client
        .get(format!("http://{addr}/exec"))
        .query(&[("cmd", "rm -rf /"), ("token", "s3cret")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["returncode"], -2);

    let resp = client
        .post(format!("http://{addr}/write_file"))
        .header("x-auth", "s3cret")
        .json(&json!({"path": "notes/a.txt", "content": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(std::fs::read_to_string(dir.path().join("notes/a.txt")).unwrap(), "hi");

    let resp = client.get(format!("http://{addr}/exec?cmd=ls")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

// ─── Shutdown ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_reaches_every_monitor() {
    let store: Arc<dyn StateSink> = Arc::new(store_at(
        &format!("http://{}", dead_addr().await),
        RetryPolicy::once(),
    ));
    let shutdown = ShutdownSignal::new();
    let ctx = Arc::new(BridgeContext::new(
        BridgeConfig::default(),
        Arc::new(NoTermux),
        Arc::new(DisabledNotifier),
        Some(store),
        shutdown.clone(),
    ));

    let handles = loops::spawn_all(&ctx, ctx.config.port);
    assert_eq!(handles.len(), 3);

    tokio::time::sleep(ms(20)).await;
    shutdown.trigger();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn without_a_store_only_the_watchdog_runs() {
    let shutdown = ShutdownSignal::new();
    let ctx = Arc::new(BridgeContext::new(
        BridgeConfig::default(),
        Arc::new(NoTermux),
        Arc::new(DisabledNotifier),
        None,
        shutdown.clone(),
    ));
    let handles = loops::spawn_all(&ctx, ctx.config.port);
    assert_eq!(handles.len(), 1);
    shutdown.trigger();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
