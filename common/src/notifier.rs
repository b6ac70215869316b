// Outbound notification dispatcher. Fires HMAC-signed webhooks for build and
// run lifecycle events; deliveries are best-effort and never affect the
// status of the build that produced them.

use crate::config::NotifierConfig;
use crate::errors::NotifyError;
use crate::models::{NotificationConfig, NotifyEvent, RunStatus, TriggerSource};
use crate::retry::Backoff;
use crate::store::Store;
use crate::webhook;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Minimal outbound HTTP contract, so tests and alternate transports can
/// stand in for the real client
#[async_trait]
pub trait HttpPoster: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<u16, NotifyError>;
}

pub struct ReqwestPoster {
    client: reqwest::Client,
}

impl ReqwestPoster {
    pub fn new() -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpPoster for ReqwestPoster {
    async fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<u16, NotifyError> {
        let mut request = self
            .client
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json");
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// Which side of the engine produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Pipeline,
    Freestyle,
}

/// A lifecycle event as emitted by the executors
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub event: NotifyEvent,
    pub target_kind: TargetKind,
    pub target_id: Uuid,
    pub target_name: String,
    pub number: i64,
    pub status: RunStatus,
    pub duration_ms: Option<i64>,
    pub trigger: TriggerSource,
    pub timestamp: DateTime<Utc>,
}

/// Wire shape of an outbound notification body
#[derive(Debug, Serialize)]
struct NotifyPayload<'a> {
    event: &'a str,
    timestamp: String,
    target_kind: TargetKind,
    target_id: Uuid,
    target_name: &'a str,
    number: i64,
    status: &'a str,
    duration_ms: Option<i64>,
    trigger: &'a str,
}

impl LifecycleEvent {
    fn to_body(&self) -> Vec<u8> {
        let payload = NotifyPayload {
            event: self.event.as_str(),
            timestamp: self.timestamp.to_rfc3339(),
            target_kind: self.target_kind,
            target_id: self.target_id,
            target_name: &self.target_name,
            number: self.number,
            status: self.status.as_str(),
            duration_ms: self.duration_ms,
            trigger: self.trigger.as_str(),
        };
        serde_json::to_vec(&payload).unwrap_or_default()
    }
}

pub struct Notifier {
    store: Arc<Store>,
    poster: Arc<dyn HttpPoster>,
    config: NotifierConfig,
    backoff: Backoff,
}

impl Notifier {
    pub fn new(store: Arc<Store>, poster: Arc<dyn HttpPoster>, config: NotifierConfig) -> Self {
        Self {
            store,
            poster,
            config,
            backoff: Backoff::notifier(),
        }
    }

    /// Fire-and-forget: matching deliveries run on their own task
    pub fn emit(self: &Arc<Self>, event: LifecycleEvent) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            notifier.dispatch(event).await;
        });
    }

    /// Deliver an event to every matching enabled config and wait for the
    /// outcomes. Used directly by tests and the notification test endpoint.
    #[instrument(skip(self, event), fields(event = event.event.as_str()))]
    pub async fn dispatch(&self, event: LifecycleEvent) {
        let matching: Vec<NotificationConfig> = self
            .store
            .notifications()
            .filter(|c| Self::matches(c, &event));
        if matching.is_empty() {
            return;
        }
        debug!(count = matching.len(), "Dispatching notifications");
        let body = event.to_body();
        let mut handles = Vec::new();
        for config in matching {
            let poster = Arc::clone(&self.poster);
            let body = body.clone();
            let backoff = self.backoff.clone();
            let timeout = Duration::from_secs(self.config.request_timeout_seconds);
            let max_retries = self.config.max_retries;
            handles.push(tokio::spawn(async move {
                deliver(&*poster, &config, body, timeout, max_retries, &backoff).await
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Deliver a synthetic event to a single config, bypassing matching
    pub async fn send_test(&self, config: &NotificationConfig) -> Result<u16, NotifyError> {
        let event = LifecycleEvent {
            event: NotifyEvent::BuildSucceeded,
            target_kind: TargetKind::Freestyle,
            target_id: Uuid::nil(),
            target_name: "notification-test".to_string(),
            number: 0,
            status: RunStatus::Succeeded,
            duration_ms: Some(0),
            trigger: TriggerSource::Manual,
            timestamp: Utc::now(),
        };
        let timeout = Duration::from_secs(self.config.request_timeout_seconds);
        deliver(
            &*self.poster,
            config,
            event.to_body(),
            timeout,
            0,
            &self.backoff,
        )
        .await
    }

    fn matches(config: &NotificationConfig, event: &LifecycleEvent) -> bool {
        if !config.enabled || !config.events.contains(&event.event) {
            return false;
        }
        match event.target_kind {
            TargetKind::Pipeline => {
                config.pipeline_ids.is_empty() || config.pipeline_ids.contains(&event.target_id)
            }
            TargetKind::Freestyle => {
                config.job_ids.is_empty() || config.job_ids.contains(&event.target_id)
            }
        }
    }
}

/// One delivery with retry. Attempt 0 is the initial POST; each retry sleeps
/// the backoff schedule first. A non-2xx status counts as a failure.
async fn deliver(
    poster: &dyn HttpPoster,
    config: &NotificationConfig,
    body: Vec<u8>,
    timeout: Duration,
    max_retries: u32,
    backoff: &Backoff,
) -> Result<u16, NotifyError> {
    let mut headers = config.headers.clone();
    if let Some(secret) = &config.secret {
        headers.insert(
            webhook::OUTBOUND_SIGNATURE_HEADER.to_string(),
            webhook::sign_payload(secret, &body),
        );
    }

    let mut attempt = 0u32;
    loop {
        match poster.post(&config.url, &headers, body.clone(), timeout).await {
            Ok(status) if (200..300).contains(&status) => {
                metrics::counter!("gagos_notifications_delivered_total").increment(1);
                info!(config = %config.name, status, "Notification delivered");
                return Ok(status);
            }
            Ok(status) => {
                warn!(config = %config.name, status, attempt, "Notification rejected");
            }
            Err(e) => {
                warn!(config = %config.name, error = %e, attempt, "Notification delivery failed");
            }
        }
        if attempt >= max_retries {
            metrics::counter!("gagos_notifications_dropped_total").increment(1);
            warn!(config = %config.name, "Notification dropped after retries");
            return Err(NotifyError::RetriesExhausted(attempt + 1));
        }
        if let Some(delay) = backoff.delay(attempt) {
            tokio::time::sleep(delay).await;
        }
        metrics::counter!("gagos_notifications_retried_total").increment(1);
        attempt += 1;
    }
}
