//! Command ingestion.
//!
//! `IngestionService::submit` validates a request, then writes the command and
//! its outbox event in one store transaction through the [`IdempotencyGuard`].
//! Nothing becomes visible to dispatchers until that transaction commits.

mod guard;

pub use guard::IdempotencyGuard;

use std::collections::HashSet;
use std::sync::Arc;

use backon::Retryable;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::model::{now, Command, CommandStatus, OutboxEvent, SubmitOutcome};
use crate::storage::{CommandStore, StorageError};
use crate::utils::retry::submit_backoff;

/// Errors surfaced to the submitting client.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Caller error. Never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(Uuid),

    /// Transient. Safe to retry because submission is keyed on the
    /// idempotency key.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StorageError),
}

impl IngestError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Accepts commands exactly once per idempotency key.
pub struct IngestionService {
    store: Arc<dyn CommandStore>,
    guard: IdempotencyGuard,
    command_types: HashSet<String>,
    max_key_length: usize,
    topic_prefix: String,
    wakeup: Option<Arc<Notify>>,
}

impl IngestionService {
    pub fn new(store: Arc<dyn CommandStore>, config: &IngestConfig) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            store,
            command_types: config.command_types.iter().cloned().collect(),
            max_key_length: config.max_key_length,
            topic_prefix: config.topic_prefix.clone(),
            wakeup: None,
        }
    }

    /// Nudge an in-process dispatcher after each new command.
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = Some(wakeup);
        self
    }

    fn validate(&self, idempotency_key: &str, command_type: &str) -> Result<()> {
        if idempotency_key.trim().is_empty() {
            return Err(IngestError::InvalidRequest(
                "idempotency key must not be empty".to_string(),
            ));
        }
        if idempotency_key.len() > self.max_key_length {
            return Err(IngestError::InvalidRequest(format!(
                "idempotency key exceeds {} bytes",
                self.max_key_length
            )));
        }
        if command_type.trim().is_empty() {
            return Err(IngestError::InvalidRequest(
                "command type must not be empty".to_string(),
            ));
        }
        if !self.command_types.is_empty() && !self.command_types.contains(command_type) {
            return Err(IngestError::InvalidRequest(format!(
                "unrecognized command type: {command_type}"
            )));
        }
        Ok(())
    }

    fn topic_for(&self, command_type: &str) -> String {
        if self.topic_prefix.is_empty() {
            command_type.to_string()
        } else {
            format!("{}.{}", self.topic_prefix, command_type)
        }
    }

    /// Accept a command.
    ///
    /// Returns `Created` with a new `PENDING` command, or `AlreadyExists` with
    /// the command that first used `idempotency_key`. A replay ignores the new
    /// payload and writes nothing.
    pub async fn submit(
        &self,
        idempotency_key: &str,
        command_type: &str,
        payload: serde_json::Value,
    ) -> Result<SubmitOutcome> {
        self.validate(idempotency_key, command_type)?;

        let command = Command::new(idempotency_key, command_type, payload, now());
        let event = OutboxEvent::for_command(&command, self.topic_for(command_type))
            .map_err(StorageError::from)?;

        let outcome = self.guard.create_or_replay(command, event).await?;
        match &outcome {
            SubmitOutcome::Created(command) => {
                info!(
                    command_id = %command.id,
                    idempotency_key = %command.idempotency_key,
                    command_type = %command.command_type,
                    "Command accepted"
                );
                if let Some(wakeup) = &self.wakeup {
                    wakeup.notify_one();
                }
            }
            SubmitOutcome::AlreadyExists(command) => {
                debug!(
                    command_id = %command.id,
                    idempotency_key = %command.idempotency_key,
                    "Command replayed"
                );
            }
        }
        Ok(outcome)
    }

    /// [`submit`](Self::submit), retrying while the store is unavailable.
    pub async fn submit_with_retry(
        &self,
        idempotency_key: &str,
        command_type: &str,
        payload: serde_json::Value,
    ) -> Result<SubmitOutcome> {
        (|| self.submit(idempotency_key, command_type, payload.clone()))
            .retry(submit_backoff())
            .when(IngestError::is_retryable)
            .notify(|err, delay| {
                warn!(
                    idempotency_key = %idempotency_key,
                    error = %err,
                    retry_in = ?delay,
                    "Submit failed, retrying"
                );
            })
            .await
    }

    pub async fn find(&self, command_id: Uuid) -> Result<Option<Command>> {
        Ok(self.store.find_command(command_id).await?)
    }

    /// Record that the command's business effect completed.
    pub async fn complete(&self, command_id: Uuid) -> Result<Command> {
        self.settle(command_id, CommandStatus::Completed, None).await
    }

    /// Record that the command's business effect failed.
    pub async fn fail(&self, command_id: Uuid, error: &str) -> Result<Command> {
        self.settle(command_id, CommandStatus::Failed, Some(error))
            .await
    }

    /// Move a `PENDING` command to `status`. Settling an already settled
    /// command is a no-op that returns its current state.
    async fn settle(
        &self,
        command_id: Uuid,
        status: CommandStatus,
        error: Option<&str>,
    ) -> Result<Command> {
        let changed = self
            .store
            .update_command_status(command_id, status, error, now())
            .await?;

        let command = self
            .store
            .find_command(command_id)
            .await?
            .ok_or(IngestError::UnknownCommand(command_id))?;

        if changed {
            info!(command_id = %command_id, status = %status, "Command settled");
        } else {
            debug!(
                command_id = %command_id,
                current = %command.status,
                requested = %status,
                "Command already settled"
            );
        }
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::{CommandStatus, OutboxStatus};
    use crate::storage::MockCommandStore;

    fn service(store: Arc<MockCommandStore>) -> IngestionService {
        IngestionService::new(store, &IngestConfig::default())
    }

    #[tokio::test]
    async fn test_submit_creates_command_and_event() {
        let store = Arc::new(MockCommandStore::new());
        let svc = service(store.clone());

        let outcome = svc.submit("abc-1", "CreateUser", json!({"x": 1})).await.unwrap();
        let command = outcome.command().clone();
        assert!(!outcome.is_replay());
        assert_eq!(command.status, CommandStatus::Pending);

        let events = store.events_for_command(command.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, OutboxStatus::Pending);
        assert_eq!(events[0].topic, "commands.CreateUser");
    }

    #[tokio::test]
    async fn test_resubmit_returns_original() {
        let store = Arc::new(MockCommandStore::new());
        let svc = service(store.clone());

        let first = svc.submit("abc-1", "CreateUser", json!({"x": 1})).await.unwrap();
        let second = svc.submit("abc-1", "CreateUser", json!({"x": 2})).await.unwrap();

        assert!(second.is_replay());
        assert_eq!(second.receipt(), first.receipt());
        assert_eq!(second.command().payload, json!({"x": 1}));
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_requests_touch_nothing() {
        let store = Arc::new(MockCommandStore::new());
        store.set_unavailable(true).await;
        let config = IngestConfig {
            command_types: vec!["CreateUser".to_string()],
            max_key_length: 8,
            ..Default::default()
        };
        let svc = IngestionService::new(store.clone(), &config);

        for (key, ty) in [("", "CreateUser"), ("  ", "CreateUser"), ("k", ""), ("k", "Drop"), ("123456789", "CreateUser")] {
            let err = svc.submit(key, ty, json!({})).await.unwrap_err();
            assert!(matches!(err, IngestError::InvalidRequest(_)), "{key:?}/{ty:?}: {err}");
            assert!(!err.is_retryable());
        }
    }

    #[tokio::test]
    async fn test_store_outage_is_retryable() {
        let store = Arc::new(MockCommandStore::new());
        store.set_unavailable(true).await;
        let svc = service(store);

        let err = svc.submit("abc-1", "CreateUser", json!({})).await.unwrap_err();
        assert!(matches!(err, IngestError::StoreUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_submit_with_retry_recovers() {
        let store = Arc::new(MockCommandStore::new());
        store.set_unavailable(true).await;
        let svc = Arc::new(service(store.clone()));

        let healer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(60)).await;
                store.set_unavailable(false).await;
            })
        };

        let outcome = svc
            .submit_with_retry("abc-1", "CreateUser", json!({}))
            .await
            .unwrap();
        healer.await.unwrap();
        assert!(!outcome.is_replay());
        assert_eq!(store.command_count().await, 1);
    }

    #[tokio::test]
    async fn test_wakeup_notified_on_create_only() {
        let store = Arc::new(MockCommandStore::new());
        let wakeup = Arc::new(Notify::new());
        let svc = service(store).with_wakeup(wakeup.clone());

        svc.submit("abc-1", "CreateUser", json!({})).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), wakeup.notified())
            .await
            .expect("permit stored by submit");

        svc.submit("abc-1", "CreateUser", json!({})).await.unwrap();
        let replay_wake =
            tokio::time::timeout(std::time::Duration::from_millis(50), wakeup.notified()).await;
        assert!(replay_wake.is_err());
    }

    #[tokio::test]
    async fn test_complete_and_fail_signals() {
        let store = Arc::new(MockCommandStore::new());
        let svc = service(store);

        let a = svc.submit("a", "CreateUser", json!({})).await.unwrap();
        let b = svc.submit("b", "CreateUser", json!({})).await.unwrap();

        let done = svc.complete(a.command().id).await.unwrap();
        assert_eq!(done.status, CommandStatus::Completed);

        let failed = svc.fail(b.command().id, "quota exceeded").await.unwrap();
        assert_eq!(failed.status, CommandStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("quota exceeded"));

        // Already settled: state is unchanged.
        let again = svc.fail(a.command().id, "late").await.unwrap();
        assert_eq!(again.status, CommandStatus::Completed);

        let missing = svc.complete(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(missing, IngestError::UnknownCommand(_)));
    }
}
