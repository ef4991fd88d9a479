//! Broker publisher adapters.
//!
//! This module contains:
//! - `BrokerPublisher` trait: hand one outbox message to the downstream broker
//! - Implementations: log, in-process channel, HTTP webhook, mock
//! - `TimeoutPublisher`: adapter-level timeout around any publisher
//!
//! Adapters never retry. A failed publish is reported once and the dispatcher
//! decides between requeue and dead-letter, keeping attempt bookkeeping in the
//! store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{PublisherConfig, PublisherType};
use crate::model::OutboxMessage;

pub mod channel;
pub mod log;
pub mod mock;
pub mod timeout;
pub mod webhook;

pub use channel::ChannelPublisher;
pub use log::LogPublisher;
pub use mock::MockPublisher;
pub use timeout::TimeoutPublisher;
pub use webhook::{HttpPublisher, HttpPublisherConfig};

/// Result type for publish operations.
pub type Result<T> = std::result::Result<T, PublishError>;

/// Ways a publish can fail. The dispatcher treats every variant the same.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Broker rejected message: {0}")]
    Rejected(String),

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Publisher misconfigured: {0}")]
    Config(String),
}

/// Broker acknowledgement: the message was durably accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    /// Broker-specific receipt, when the broker returns one.
    pub receipt: Option<String>,
}

/// Interface for delivering outbox messages to a broker.
///
/// Implementations:
/// - `LogPublisher`: writes each message to the log
/// - `ChannelPublisher`: tokio broadcast for in-process subscribers
/// - `HttpPublisher`: webhook POST
/// - `MockPublisher`: records messages for tests
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Deliver one message.
    ///
    /// The message payload carries the outbox event id so consumers can
    /// deduplicate redeliveries.
    async fn publish(&self, message: &OutboxMessage) -> Result<Ack>;

    /// Adapter name for logs.
    fn name(&self) -> &str;
}

/// Build the configured publisher, wrapped in the adapter-level timeout.
pub fn from_config(config: &PublisherConfig) -> Result<Arc<dyn BrokerPublisher>> {
    let inner: Arc<dyn BrokerPublisher> = match config.publisher_type {
        PublisherType::Log => Arc::new(LogPublisher),
        PublisherType::Webhook => {
            Arc::new(HttpPublisher::new(HttpPublisherConfig::from(&config.webhook))?)
        }
    };

    let timeout = Duration::from_secs(config.publish_timeout_secs);
    info!(publisher = inner.name(), timeout = ?timeout, "Broker publisher configured");
    Ok(Arc::new(TimeoutPublisher::new(inner, timeout)))
}
