//! HTTP webhook publisher.
//!
//! POSTs each outbox message to a configured endpoint. The body is the event
//! envelope; the event id is repeated in the `Idempotency-Key` header so the
//! receiver can deduplicate without parsing the body. Any 2xx counts as
//! durable acceptance.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use super::{Ack, BrokerPublisher, PublishError, Result};
use crate::config::WebhookConfig;
use crate::model::OutboxMessage;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const TOPIC_HEADER: &str = "X-Courier-Topic";
pub const MESSAGE_KEY_HEADER: &str = "X-Courier-Key";
pub const ATTEMPT_HEADER: &str = "X-Courier-Attempt";

/// HTTP publisher configuration.
#[derive(Debug, Clone)]
pub struct HttpPublisherConfig {
    /// Webhook endpoint URL.
    pub endpoint: String,

    /// Request timeout.
    pub timeout: Duration,

    /// Additional headers to include.
    pub headers: Vec<(String, String)>,
}

impl Default for HttpPublisherConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: Duration::from_secs(5),
            headers: Vec::new(),
        }
    }
}

impl From<&WebhookConfig> for HttpPublisherConfig {
    fn from(config: &WebhookConfig) -> Self {
        let mut headers: Vec<_> = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();
        Self {
            endpoint: config.endpoint.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            headers,
        }
    }
}

impl HttpPublisherConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Webhook publisher.
pub struct HttpPublisher {
    client: Client,
    config: HttpPublisherConfig,
}

impl HttpPublisher {
    pub fn new(config: HttpPublisherConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(PublishError::Config(
                "webhook endpoint not configured".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PublishError::Config(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn send_error(&self, err: reqwest::Error) -> PublishError {
        if err.is_timeout() {
            PublishError::Timeout(self.config.timeout)
        } else {
            PublishError::Connection(err.to_string())
        }
    }
}

#[async_trait]
impl BrokerPublisher for HttpPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<Ack> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("Content-Type", "application/json")
            .header(IDEMPOTENCY_KEY_HEADER, message.event_id.to_string())
            .header(TOPIC_HEADER, &message.topic)
            .header(MESSAGE_KEY_HEADER, &message.key)
            .header(ATTEMPT_HEADER, message.attempt.to_string())
            .body(message.payload.clone());

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| self.send_error(e))?;
        let status = response.status();

        if status.is_success() {
            debug!(
                endpoint = %self.config.endpoint,
                event_id = %message.event_id,
                status = %status,
                "Webhook accepted outbox message"
            );
            return Ok(Ack {
                receipt: Some(status.as_u16().to_string()),
            });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            endpoint = %self.config.endpoint,
            event_id = %message.event_id,
            status = %status,
            body = %body,
            "Webhook refused outbox message"
        );
        Err(PublishError::Rejected(format!(
            "HTTP {} - {}",
            status,
            body.chars().take(200).collect::<String>()
        )))
    }

    fn name(&self) -> &str {
        "webhook"
    }
}
