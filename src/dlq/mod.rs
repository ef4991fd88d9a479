//! Dead-letter reporting.
//!
//! An outbox event that exhausts its claim budget is moved to `FAILED` in the
//! store. That row is the dead letter; the notifier here only carries the
//! operational signal (alerting, log) so an operator can intervene.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::model::OutboxEvent;

/// Errors that can occur while reporting a dead letter.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to deliver dead-letter notice: {0}")]
    PublishFailed(String),
}

/// An outbox event that will not be retried again.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub event_id: Uuid,
    pub command_id: Uuid,
    pub topic: String,
    pub attempts: i32,
    /// Last publish error, if any was recorded.
    pub error: String,
    /// Dispatcher that moved the row to `FAILED`.
    pub worker_id: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_event(
        event: &OutboxEvent,
        attempts: i32,
        error: impl Into<String>,
        worker_id: &str,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event.id,
            command_id: event.command_id,
            topic: event.topic.clone(),
            attempts,
            error: error.into(),
            worker_id: worker_id.to_string(),
            failed_at,
        }
    }
}

/// Operational channel for dead-lettered events.
#[async_trait]
pub trait DeadLetterNotifier: Send + Sync {
    async fn notify(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;
}

/// Reports dead letters as `error!` log records.
pub struct LogDeadLetterNotifier;

#[async_trait]
impl DeadLetterNotifier for LogDeadLetterNotifier {
    async fn notify(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        error!(
            event_id = %dead_letter.event_id,
            command_id = %dead_letter.command_id,
            topic = %dead_letter.topic,
            attempts = dead_letter.attempts,
            worker_id = %dead_letter.worker_id,
            error = %dead_letter.error,
            "Outbox event dead-lettered after exhausting attempts"
        );
        Ok(())
    }
}

/// In-memory notifier using a channel.
///
/// Used for embedding and testing.
pub struct ChannelDeadLetterNotifier {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterNotifier {
    /// Returns the notifier and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterNotifier for ChannelDeadLetterNotifier {
    async fn notify(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(event_id = %dead_letter.event_id, "Forwarding dead letter to channel");
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}
