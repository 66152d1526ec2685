//! Bounded retry with a fixed backoff schedule.

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Longest slice of an error response body kept in [`PushError::Status`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request could not be built: {0}")]
    Request(String),

    #[error("gave up after {attempts} attempt(s): {last}")]
    ExhaustedRetries { attempts: u32, last: Box<PushError> },
}

impl PushError {
    /// The error from the final attempt, unwrapping [`PushError::ExhaustedRetries`].
    pub fn last(&self) -> &PushError {
        match self {
            Self::ExhaustedRetries { last, .. } => last.last(),
            other => other,
        }
    }

    /// Calls made before giving up. Errors raised before any call count as one.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::ExhaustedRetries { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

/// A successful push: the 2xx response body and the calls it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub body: Bytes,
    pub attempts: u32,
}

pub type PushResult<T> = std::result::Result<T, PushError>;

// ─── Policy ───────────────────────────────────────────────────────────────────

/// How many times to try and how long to wait in between.
///
/// The schedule caps the attempt count: at most `schedule.len() + 1` calls are
/// made, so the total time spent sleeping never exceeds the schedule's sum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub schedule: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, schedule: Vec<Duration>) -> Self {
        Self {
            max_attempts,
            schedule,
        }
    }

    pub fn from_secs(max_attempts: u32, secs: &[u64]) -> Self {
        Self::new(max_attempts, secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// A policy that tries exactly once.
    pub fn once() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn effective_attempts(&self) -> u32 {
        let cap = u32::try_from(self.schedule.len()).unwrap_or(u32::MAX).saturating_add(1);
        self.max_attempts.clamp(1, cap)
    }

    /// Delay after the `retry`-th failure (0-based). Clamped to the last entry.
    pub fn delay_for(&self, retry: usize) -> Duration {
        match self.schedule.last() {
            Some(last) => self.schedule.get(retry).copied().unwrap_or(*last),
            None => Duration::ZERO,
        }
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn max_total_delay(&self) -> Duration {
        let retries = self.effective_attempts().saturating_sub(1) as usize;
        (0..retries).map(|i| self.delay_for(i)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(5, &[2, 4, 8, 16, 32])
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

/// A reqwest client wrapped with a [`RetryPolicy`] and an optional shutdown token.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct RetryingHttpClient {
    client: reqwest::Client,
    policy: RetryPolicy,
    shutdown: Option<CancellationToken>,
}

impl RetryingHttpClient {
    /// Build a client whose every attempt is bounded by `request_timeout`.
    pub fn new(policy: RetryPolicy, request_timeout: Duration) -> PushResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PushError::Request(e.to_string()))?;
        Ok(Self {
            client,
            policy,
            shutdown: None,
        })
    }

    /// Abandon backoff sleeps once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// POST `body` to `url`, retrying on transport errors and non-2xx statuses.
    ///
    /// Returns the body of the first 2xx response.
    pub async fn post(&self, url: &str, body: Bytes, headers: HeaderMap) -> PushResult<Delivered> {
        let attempts = self.policy.effective_attempts();
        let mut attempt = 1u32;
        loop {
            match self.send_once(url, body.clone(), headers.clone()).await {
                Ok(bytes) => {
                    if attempt > 1 {
                        debug!(url, attempt, "push succeeded after retry");
                    }
                    return Ok(Delivered {
                        body: bytes,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!(url, attempt, max_attempts = attempts, error = %e, "push attempt failed");
                    if attempt >= attempts {
                        return Err(PushError::ExhaustedRetries {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    let delay = self.policy.delay_for(attempt as usize - 1);
                    if !self.backoff(delay).await {
                        debug!(url, attempt, "shutdown during backoff, abandoning push");
                        return Err(PushError::ExhaustedRetries {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Serialize `value` as JSON and [`post`](Self::post) it.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        value: &T,
        mut headers: HeaderMap,
    ) -> PushResult<Delivered> {
        let body = serde_json::to_vec(value).map_err(|e| PushError::Request(e.to_string()))?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.post(url, Bytes::from(body), headers).await
    }

    async fn send_once(&self, url: &str, body: Bytes, headers: HeaderMap) -> PushResult<Bytes> {
        let resp = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let mut text = resp.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(PushError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        resp.bytes()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))
    }

    /// Sleep for `delay`. Returns false if shutdown fired first.
    async fn backoff(&self, delay: Duration) -> bool {
        match &self.shutdown {
            Some(token) => tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            },
            None => {
                tokio::time::sleep(delay).await;
                true
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use axum::{Router, http::StatusCode, routing::post};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Endpoint that fails with 500 for the first `fail_first` calls.
    async fn flaky_endpoint(fail_first: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/push",
            post(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < fail_first {
                        (StatusCode::INTERNAL_SERVER_ERROR, "upstream down")
                    } else {
                        (StatusCode::OK, "stored")
                    }
                }
            }),
        );
        let addr = testutil::serve(app).await;
        (format!("http://{addr}/push"), hits)
    }

    fn ms(v: &[u64]) -> Vec<Duration> {
        v.iter().copied().map(Duration::from_millis).collect()
    }

    // ── Policy ───────────────────────────────────────────────────────────────

    #[test]
    fn schedule_length_caps_attempts() {
        assert_eq!(RetryPolicy::new(10, ms(&[1, 2])).effective_attempts(), 3);
        assert_eq!(RetryPolicy::new(2, ms(&[1, 2, 3])).effective_attempts(), 2);
        assert_eq!(RetryPolicy::new(5, Vec::new()).effective_attempts(), 1);
        assert_eq!(RetryPolicy::new(0, ms(&[1])).effective_attempts(), 1);
    }

    #[test]
    fn delay_is_clamped_to_last_entry() {
        let p = RetryPolicy::new(10, ms(&[100, 200]));
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(7), Duration::from_millis(200));
        assert_eq!(RetryPolicy::once().delay_for(3), Duration::ZERO);
    }

    #[test]
    fn total_delay_never_exceeds_schedule_sum() {
        let p = RetryPolicy::default();
        let sum: Duration = p.schedule.iter().sum();
        assert!(p.max_total_delay() <= sum);
        assert_eq!(p.effective_attempts(), 5);
        assert_eq!(p.max_total_delay(), Duration::from_secs(2 + 4 + 8 + 16));
    }

    // ── Client ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn retries_until_success_with_schedule_delays() {
        let (url, hits) = flaky_endpoint(2).await;
        let client =
            RetryingHttpClient::new(RetryPolicy::new(5, ms(&[200, 400])), Duration::from_secs(5))
                .unwrap();

        let started = Instant::now();
        let delivered = client
            .post(&url, Bytes::from_static(b"{}"), HeaderMap::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(&delivered.body[..], b"stored");
        assert_eq!(delivered.attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3, "exactly three calls");
        assert!(elapsed >= Duration::from_millis(600), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn exhausted_retries_report_last_status() {
        let (url, hits) = flaky_endpoint(usize::MAX).await;
        let client =
            RetryingHttpClient::new(RetryPolicy::new(10, ms(&[10, 10])), Duration::from_secs(5))
                .unwrap();

        let err = client.post(&url, Bytes::new(), HeaderMap::new()).await.unwrap_err();
        assert_eq!(err.attempts(), 3);
        match &err {
            PushError::ExhaustedRetries { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert!(matches!(**last, PushError::Status { status: 500, .. }), "{last}");
            }
            other => panic!("expected ExhaustedRetries, got {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_schedule_makes_single_attempt() {
        let (url, hits) = flaky_endpoint(usize::MAX).await;
        let client =
            RetryingHttpClient::new(RetryPolicy::new(4, Vec::new()), Duration::from_secs(5))
                .unwrap();
        assert!(client.post(&url, Bytes::new(), HeaderMap::new()).await.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let addr = testutil::dead_addr().await;
        let client = RetryingHttpClient::new(RetryPolicy::new(2, ms(&[5])), Duration::from_secs(2))
            .unwrap();
        let err = client
            .post(&format!("http://{addr}/push"), Bytes::new(), HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err.last(), PushError::Transport(_)), "{err}");
    }

    #[tokio::test]
    async fn shutdown_abandons_backoff() {
        let (url, hits) = flaky_endpoint(usize::MAX).await;
        let token = CancellationToken::new();
        let policy = RetryPolicy::new(3, ms(&[10_000, 10_000]));
        let client = RetryingHttpClient::new(policy, Duration::from_secs(5))
            .unwrap()
            .with_shutdown(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let started = Instant::now();
        let err = client.post(&url, Bytes::new(), HeaderMap::new()).await.unwrap_err();
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5), "backoff was not interrupted");
        assert!(matches!(err, PushError::ExhaustedRetries { attempts: 1, .. }), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_json_sets_content_type() {
        let app = Router::new().route(
            "/json",
            post(|headers: axum::http::HeaderMap| async move {
                let ct = headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if ct == "application/json" {
                    StatusCode::NO_CONTENT
                } else {
                    StatusCode::UNSUPPORTED_MEDIA_TYPE
                }
            }),
        );
        let addr = testutil::serve(app).await;
        let client = RetryingHttpClient::new(RetryPolicy::once(), Duration::from_secs(2)).unwrap();
        let url = format!("http://{addr}/json");
        client
            .post_json(&url, &serde_json::json!({"a": 1}), HeaderMap::new())
            .await
            .unwrap();
    }
}
