//! Mock CommandStore implementation for testing.
//!
//! Keeps both tables behind one lock so the ingestion insert and every
//! conditional update are atomic, mirroring the SQL backends.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{
    ClaimFence, Command, CommandStatus, OutboxEvent, OutboxStats, OutboxStatus,
};
use crate::storage::{CommandStore, Result, StorageError};

#[derive(Default)]
struct Tables {
    commands: HashMap<Uuid, Command>,
    keys: HashMap<String, Uuid>,
    events: HashMap<Uuid, OutboxEvent>,
}

impl Tables {
    /// Mutable access to `id` if it still matches `fence`.
    fn fenced_mut(&mut self, id: Uuid, fence: ClaimFence) -> Option<&mut OutboxEvent> {
        self.events
            .get_mut(&id)
            .filter(|e| e.status == fence.status && e.attempts == fence.attempts)
    }
}

/// Mock command store that keeps rows in memory.
#[derive(Default)]
pub struct MockCommandStore {
    tables: RwLock<Tables>,
    unavailable: RwLock<bool>,
}

impl MockCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StorageError::Unavailable`].
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    pub async fn command_count(&self) -> usize {
        self.tables.read().await.commands.len()
    }

    pub async fn event_count(&self) -> usize {
        self.tables.read().await.events.len()
    }

    /// Overwrite a stored event, bypassing the fence. For arranging test state.
    pub async fn put_event(&self, event: OutboxEvent) {
        self.tables.write().await.events.insert(event.id, event);
    }

    async fn check_available(&self) -> Result<()> {
        if *self.unavailable.read().await {
            return Err(StorageError::Unavailable("mock store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandStore for MockCommandStore {
    async fn insert_command(&self, command: &Command, event: &OutboxEvent) -> Result<()> {
        self.check_available().await?;
        let mut tables = self.tables.write().await;
        if tables.keys.contains_key(&command.idempotency_key) {
            return Err(StorageError::DuplicateKey(command.idempotency_key.clone()));
        }
        if event.command_id != command.id {
            return Err(StorageError::InvalidData(format!(
                "event {} does not reference command {}",
                event.id, command.id
            )));
        }
        if tables.commands.contains_key(&command.id) {
            return Err(StorageError::InvalidData(format!(
                "command id {} already exists",
                command.id
            )));
        }
        if tables.events.contains_key(&event.id) {
            return Err(StorageError::InvalidData(format!(
                "outbox event id {} already exists",
                event.id
            )));
        }
        tables
            .keys
            .insert(command.idempotency_key.clone(), command.id);
        tables.commands.insert(command.id, command.clone());
        tables.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn find_command(&self, id: Uuid) -> Result<Option<Command>> {
        self.check_available().await?;
        Ok(self.tables.read().await.commands.get(&id).cloned())
    }

    async fn find_command_by_key(&self, idempotency_key: &str) -> Result<Option<Command>> {
        self.check_available().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .keys
            .get(idempotency_key)
            .and_then(|id| tables.commands.get(id))
            .cloned())
    }

    async fn update_command_status(
        &self,
        id: Uuid,
        status: CommandStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.check_available().await?;
        let mut tables = self.tables.write().await;
        match tables.commands.get_mut(&id) {
            Some(command) if command.status == CommandStatus::Pending => {
                command.status = status;
                command.last_error = error.map(str::to_string);
                command.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        self.check_available().await?;
        Ok(self.tables.read().await.events.get(&id).cloned())
    }

    async fn events_for_command(&self, command_id: Uuid) -> Result<Vec<OutboxEvent>> {
        self.check_available().await?;
        let tables = self.tables.read().await;
        let mut events: Vec<_> = tables
            .events
            .values()
            .filter(|e| e.command_id == command_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    async fn claimable_events(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxEvent>> {
        self.check_available().await?;
        let tables = self.tables.read().await;
        let mut events: Vec<_> = tables
            .events
            .values()
            .filter(|e| e.is_claimable(now))
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        events.truncate(limit as usize);
        Ok(events)
    }

    async fn claim(
        &self,
        id: Uuid,
        fence: ClaimFence,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxEvent>> {
        self.check_available().await?;
        let mut tables = self.tables.write().await;
        match tables.fenced_mut(id, fence) {
            Some(event) if event.is_claimable(now) => {
                event.status = OutboxStatus::Claimed;
                event.claimed_by = Some(worker_id.to_string());
                event.lease_expires_at = Some(lease_until);
                event.attempts += 1;
                Ok(Some(event.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_published(&self, id: Uuid, fence: ClaimFence, now: DateTime<Utc>) -> Result<bool> {
        self.check_available().await?;
        let mut tables = self.tables.write().await;
        let Some(event) = tables.fenced_mut(id, fence) else {
            return Ok(false);
        };
        event.status = OutboxStatus::Published;
        event.published_at = Some(now);
        event.claimed_by = None;
        event.lease_expires_at = None;
        Ok(true)
    }

    async fn release(
        &self,
        id: Uuid,
        fence: ClaimFence,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        self.check_available().await?;
        let mut tables = self.tables.write().await;
        let Some(event) = tables.fenced_mut(id, fence) else {
            return Ok(false);
        };
        event.status = OutboxStatus::Pending;
        event.claimed_by = None;
        event.lease_expires_at = None;
        event.available_at = available_at;
        event.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn mark_failed(&self, id: Uuid, fence: ClaimFence, error: &str) -> Result<bool> {
        self.check_available().await?;
        let mut tables = self.tables.write().await;
        let Some(event) = tables.fenced_mut(id, fence) else {
            return Ok(false);
        };
        event.status = OutboxStatus::Failed;
        event.claimed_by = None;
        event.lease_expires_at = None;
        event.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn outbox_stats(&self) -> Result<OutboxStats> {
        self.check_available().await?;
        let tables = self.tables.read().await;
        let mut stats = OutboxStats::default();
        for event in tables.events.values() {
            stats.add(event.status, 1);
        }
        Ok(stats)
    }
}
