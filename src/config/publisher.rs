//! Broker publisher configuration types.

use std::collections::HashMap;

use serde::Deserialize;

/// Publisher type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherType {
    /// Log each message through tracing.
    #[default]
    Log,
    /// HTTP POST to a webhook endpoint.
    Webhook,
}

/// Publisher configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    #[serde(rename = "type")]
    pub publisher_type: PublisherType,
    /// Adapter-level timeout applied to every publish call.
    pub publish_timeout_secs: u64,
    pub webhook: WebhookConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publisher_type: PublisherType::Log,
            publish_timeout_secs: 10,
            webhook: WebhookConfig::default(),
        }
    }
}

/// Webhook-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub endpoint: String,
    /// Per-request HTTP timeout.
    pub timeout_secs: u64,
    /// Extra headers sent with every request.
    pub headers: HashMap<String, String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/events".to_string(),
            timeout_secs: 5,
            headers: HashMap::new(),
        }
    }
}
