//! Idempotency guard.
//!
//! The store's uniqueness constraint on the idempotency key is the only
//! arbiter. There is no read-then-write check: the insert itself either
//! commits or reports `DuplicateKey`, and a duplicate is answered with the
//! row that won.

use std::sync::Arc;

use tracing::debug;

use crate::model::{Command, OutboxEvent, SubmitOutcome};
use crate::storage::{CommandStore, Result, StorageError};

pub struct IdempotencyGuard {
    store: Arc<dyn CommandStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn CommandStore>) -> Self {
        Self { store }
    }

    /// Commit `command` with `event`, or return the command already holding
    /// its idempotency key.
    ///
    /// A replay writes nothing, so a resubmitted request never produces a
    /// second outbox event.
    pub async fn create_or_replay(
        &self,
        command: Command,
        event: OutboxEvent,
    ) -> Result<SubmitOutcome> {
        match self.store.insert_command(&command, &event).await {
            Ok(()) => Ok(SubmitOutcome::Created(command)),
            Err(StorageError::DuplicateKey(key)) => {
                debug!(idempotency_key = %key, "Idempotency key already used, replaying");
                match self.store.find_command_by_key(&key).await? {
                    Some(existing) => Ok(SubmitOutcome::AlreadyExists(existing)),
                    // Rows are never deleted, so the winner must be visible.
                    None => Err(StorageError::InvalidData(format!(
                        "duplicate key {key} reported but no command holds it"
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }
}
