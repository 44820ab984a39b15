//! Fire-and-forget analytics. Tracking never fails the caller.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::rpc::AnalyticsEvent;

/// One id per client process, reused by every event it sends
pub fn session_id() -> &'static str {
    static SESSION_ID: OnceLock<String> = OnceLock::new();
    SESSION_ID.get_or_init(|| Uuid::new_v4().to_string())
}

impl AnalyticsEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            session_id: session_id().to_string(),
            event_type: event_type.into(),
            timestamp: Utc::now().to_rfc3339(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn track(&self, event: AnalyticsEvent);
}

pub struct HttpAnalytics {
    endpoint: Option<Url>,
    client: reqwest::Client,
}

impl HttpAnalytics {
    const TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(base_url: &str) -> Self {
        let endpoint = Url::parse(base_url)
            .and_then(|base| base.join("/api/analytics/track"))
            .map_err(|e| tracing::warn!("Analytics disabled, bad base URL {}: {}", base_url, e))
            .ok();
        let client = reqwest::Client::builder()
            .timeout(Self::TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { endpoint, client }
    }
}

#[async_trait]
impl AnalyticsSink for HttpAnalytics {
    async fn track(&self, event: AnalyticsEvent) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        match self.client.post(endpoint).json(&event).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(event_type = %event.event_type, "Analytics event sent");
            }
            Ok(response) => {
                tracing::warn!("Analytics endpoint returned {}", response.status());
            }
            Err(e) => {
                tracing::warn!("Failed to send analytics event: {}", e);
            }
        }
    }
}

/// Keeps events in memory, for embedders that read them back in-process
#[derive(Default, Clone)]
pub struct MemoryAnalytics {
    events: Arc<Mutex<Vec<AnalyticsEvent>>>,
}

impl MemoryAnalytics {
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AnalyticsSink for MemoryAnalytics {
    async fn track(&self, event: AnalyticsEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
