//! Adapter-level publish timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{Ack, BrokerPublisher, PublishError, Result};
use crate::model::OutboxMessage;

/// Bounds every publish of the wrapped adapter.
///
/// An elapsed timeout is a failure even if the broker later accepts the
/// message; the resulting redelivery is absorbed by consumer deduplication.
pub struct TimeoutPublisher {
    inner: Arc<dyn BrokerPublisher>,
    timeout: Duration,
}

impl TimeoutPublisher {
    pub fn new(inner: Arc<dyn BrokerPublisher>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl BrokerPublisher for TimeoutPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<Ack> {
        match tokio::time::timeout(self.timeout, self.inner.publish(message)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    publisher = self.inner.name(),
                    event_id = %message.event_id,
                    timeout = ?self.timeout,
                    "Publish timed out"
                );
                Err(PublishError::Timeout(self.timeout))
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
