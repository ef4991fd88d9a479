//! Mock publisher for testing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Ack, BrokerPublisher, PublishError, Result};
use crate::model::OutboxMessage;

/// Records accepted messages and fails on demand.
#[derive(Default)]
pub struct MockPublisher {
    published: RwLock<Vec<OutboxMessage>>,
    calls: RwLock<usize>,
    fail_on_publish: RwLock<bool>,
    fail_next: RwLock<u32>,
    delay: RwLock<Option<Duration>>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every publish until reset.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Fail the next `times` publishes, then succeed.
    pub async fn fail_next(&self, times: u32) {
        *self.fail_next.write().await = times;
    }

    /// Sleep before answering each publish.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }

    pub async fn published(&self) -> Vec<OutboxMessage> {
        self.published.read().await.clone()
    }

    pub async fn published_ids(&self) -> Vec<Uuid> {
        self.published.read().await.iter().map(|m| m.event_id).collect()
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Publish calls made, successful or not.
    pub async fn call_count(&self) -> usize {
        *self.calls.read().await
    }
}

#[async_trait]
impl BrokerPublisher for MockPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<Ack> {
        *self.calls.write().await += 1;

        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if *self.fail_on_publish.read().await {
            return Err(PublishError::Connection("Mock publish failure".to_string()));
        }
        {
            let mut fail_next = self.fail_next.write().await;
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(PublishError::Rejected("Mock scheduled failure".to_string()));
            }
        }

        self.published.write().await.push(message.clone());
        Ok(Ack::default())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
