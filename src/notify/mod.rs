//! Webhook notifications.
//!
//! Every call fans out to all configured endpoints. One endpoint failing
//! does not stop delivery to the others; the call reports the last failure
//! in endpoint order.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("no webhook endpoint configured")]
    NoEndpoints,
    #[error("webhook {endpoint} request failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("webhook {endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A matching activity became visible.
    New,
    /// A matching activity became eligible for timed purchase.
    Timed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::New => write!(f, "new"),
            EventKind::Timed => write!(f, "timed"),
        }
    }
}

/// Template-friendly payload for push services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructuredEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The keyword that matched.
    pub artist: String,
    pub title: String,
    #[serde(rename = "showTime")]
    pub show_time: String,
    #[serde(rename = "siteName")]
    pub site_name: String,
    pub url: String,
}

#[derive(Serialize)]
struct TextPayload<'a> {
    msg_type: &'static str,
    content: TextContent<'a>,
}

#[derive(Serialize)]
struct TextContent<'a> {
    text: &'a str,
}

impl<'a> TextPayload<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            msg_type: "text",
            content: TextContent { text },
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Plain text to the notification endpoints.
    async fn send(&self, message: &str) -> Result<(), NotifyError>;

    /// Structured event to the notification endpoints.
    async fn send_structured(&self, event: &StructuredEvent) -> Result<(), NotifyError>;

    /// Plain text to the operator alert endpoints. A no-op when none are configured.
    async fn send_alert(&self, message: &str) -> Result<(), NotifyError>;
}

/// Split a comma-separated endpoint list, dropping blanks.
pub fn split_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    webhooks: Vec<String>,
    alerts: Vec<String>,
}

impl WebhookNotifier {
    pub fn new(webhook_url: &str, alert_url: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(NotifyError::Client)?;
        Ok(Self {
            client,
            webhooks: split_endpoints(webhook_url),
            alerts: split_endpoints(alert_url),
        })
    }

    async fn post_one(&self, endpoint: &str, body: &[u8]) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|source| NotifyError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = resp.status().as_u16();
        if status >= 300 {
            return Err(NotifyError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }
        debug!(endpoint = endpoint, status = status, "webhook delivered");
        Ok(())
    }

    async fn fan_out<T: Serialize + Sync>(
        &self,
        endpoints: &[String],
        payload: &T,
    ) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(payload)?;
        let results = join_all(endpoints.iter().map(|ep| self.post_one(ep, &body))).await;

        let mut last_err = None;
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "webhook delivery failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &str) -> Result<(), NotifyError> {
        if self.webhooks.is_empty() {
            return Err(NotifyError::NoEndpoints);
        }
        self.fan_out(&self.webhooks, &TextPayload::new(message)).await
    }

    async fn send_structured(&self, event: &StructuredEvent) -> Result<(), NotifyError> {
        if self.webhooks.is_empty() {
            return Err(NotifyError::NoEndpoints);
        }
        self.fan_out(&self.webhooks, event).await
    }

    async fn send_alert(&self, message: &str) -> Result<(), NotifyError> {
        if self.alerts.is_empty() {
            return Ok(());
        }
        self.fan_out(&self.alerts, &TextPayload::new(message)).await
    }
}
