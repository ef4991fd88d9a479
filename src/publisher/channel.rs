//! In-process publisher over a tokio broadcast channel.
//!
//! Every subscriber sees every message. A send with no live subscriber is a
//! failed publish: nothing durably accepted the message.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Ack, BrokerPublisher, PublishError, Result};
use crate::model::OutboxMessage;

pub struct ChannelPublisher {
    sender: broadcast::Sender<OutboxMessage>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboxMessage> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl BrokerPublisher for ChannelPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<Ack> {
        let delivered = self
            .sender
            .send(message.clone())
            .map_err(|_| PublishError::Connection("no channel subscribers".to_string()))?;
        debug!(event_id = %message.event_id, subscribers = delivered, "Broadcast outbox message");
        Ok(Ack {
            receipt: Some(format!("subscribers={delivered}")),
        })
    }

    fn name(&self) -> &str {
        "channel"
    }
}
