//! Alert delivery to an ntfy-style topic.

use crate::retry::RetryingHttpClient;
use async_trait::async_trait;
use bridge_proto::Alert;
use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};

/// Anything that can deliver an [`Alert`]. Returns true only on confirmed delivery.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &Alert) -> bool;
}

/// POSTs alerts as JSON to a single topic URL.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: RetryingHttpClient,
    topic_url: String,
}

impl Notifier {
    pub fn new(client: RetryingHttpClient, topic_url: impl Into<String>) -> Self {
        Self {
            client,
            topic_url: topic_url.into(),
        }
    }

    pub fn topic_url(&self) -> &str {
        &self.topic_url
    }
}

#[async_trait]
impl AlertSink for Notifier {
    async fn notify(&self, alert: &Alert) -> bool {
        match self
            .client
            .post_json(&self.topic_url, &alert.to_payload(), HeaderMap::new())
            .await
        {
            Ok(_) => {
                info!(title = %alert.title, severity = %alert.severity, "alert delivered");
                true
            }
            Err(e) => {
                // Delivery failures stop here. Alerting about an alert would loop.
                warn!(title = %alert.title, error = %e, "alert delivery failed");
                false
            }
        }
    }
}

/// Sink used when no topic is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl AlertSink for DisabledNotifier {
    async fn notify(&self, alert: &Alert) -> bool {
        debug!(title = %alert.title, "no notification topic configured, dropping alert");
        false
    }
}
