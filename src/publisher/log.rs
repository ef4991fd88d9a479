//! Publisher that writes each message to the log.
//!
//! Useful for local development where no broker is running.

use async_trait::async_trait;
use tracing::info;

use super::{Ack, BrokerPublisher, Result};
use crate::model::OutboxMessage;

pub struct LogPublisher;

#[async_trait]
impl BrokerPublisher for LogPublisher {
    async fn publish(&self, message: &OutboxMessage) -> Result<Ack> {
        info!(
            event_id = %message.event_id,
            command_id = %message.command_id,
            topic = %message.topic,
            key = %message.key,
            attempt = message.attempt,
            payload = %message.payload,
            "Published outbox message"
        );
        Ok(Ack::default())
    }

    fn name(&self) -> &str {
        "log"
    }
}
