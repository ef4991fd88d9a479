//! Durable command store.
//!
//! Commands and their outbox events live in two related tables. The store
//! offers exactly two write paths: the ingestion transaction
//! ([`CommandStore::insert_command`]) and the conditional outbox updates used
//! by dispatchers (`claim`, `mark_published`, `release`, `mark_failed`).
//! Command status is the only other mutable field and is written by the
//! downstream completion signal.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::{StorageConfig, StorageType};
use crate::model::{ClaimFence, Command, CommandStatus, OutboxEvent, OutboxStats};

pub mod mock;
pub mod schema;
pub mod sql;

pub use mock::MockCommandStore;
pub use sql::SqlCommandStore;

#[cfg(feature = "postgres")]
pub use sql::postgres::PostgresCommandStore;
#[cfg(feature = "sqlite")]
pub use sql::sqlite::SqliteCommandStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A command with this idempotency key already exists.
    #[error("Duplicate idempotency key: {0}")]
    DuplicateKey(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported storage backend: {0}")]
    UnsupportedBackend(String),
}

impl From<crate::model::UnknownStatus> for StorageError {
    fn from(err: crate::model::UnknownStatus) -> Self {
        StorageError::InvalidData(err.to_string())
    }
}

/// Interface for command and outbox persistence.
///
/// Implementations:
/// - `SqliteCommandStore`: SQLite storage
/// - `PostgresCommandStore`: PostgreSQL storage
/// - `MockCommandStore`: in-memory, for tests
///
/// Every outbox mutation is a compare-and-set: it names the state the caller
/// observed and affects nothing if the row has moved on. Implementations must
/// not rely on any other form of locking.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert a command and its outbox event atomically.
    ///
    /// Fails with [`StorageError::DuplicateKey`] when the idempotency key is
    /// taken, in which case neither row is written.
    async fn insert_command(&self, command: &Command, event: &OutboxEvent) -> Result<()>;

    async fn find_command(&self, id: Uuid) -> Result<Option<Command>>;

    async fn find_command_by_key(&self, idempotency_key: &str) -> Result<Option<Command>>;

    /// Record the downstream outcome of a `PENDING` command.
    ///
    /// Returns `false` if the command is missing or no longer `PENDING`.
    async fn update_command_status(
        &self,
        id: Uuid,
        status: CommandStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn find_event(&self, id: Uuid) -> Result<Option<OutboxEvent>>;

    async fn events_for_command(&self, command_id: Uuid) -> Result<Vec<OutboxEvent>>;

    /// Rows a dispatcher may claim at `now`, oldest first.
    async fn claimable_events(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxEvent>>;

    /// Lease `id` to `worker_id` until `lease_until`.
    ///
    /// Succeeds only if the row still matches `fence` and is claimable at
    /// `now`. Increments `attempts`. `None` means another worker won.
    async fn claim(
        &self,
        id: Uuid,
        fence: ClaimFence,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxEvent>>;

    /// `CLAIMED -> PUBLISHED` for the holder of `fence`.
    async fn mark_published(&self, id: Uuid, fence: ClaimFence, now: DateTime<Utc>)
        -> Result<bool>;

    /// `CLAIMED -> PENDING` for the holder of `fence`, claimable again at
    /// `available_at`.
    async fn release(
        &self,
        id: Uuid,
        fence: ClaimFence,
        available_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool>;

    /// Move a row matching `fence` to terminal `FAILED`.
    async fn mark_failed(&self, id: Uuid, fence: ClaimFence, error: &str) -> Result<bool>;

    async fn outbox_stats(&self) -> Result<OutboxStats>;
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::InvalidData(format!("timestamp out of range: {ms}")))
}

/// Initialize storage based on configuration.
///
/// Connects, creates the schema if needed and returns the store.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn CommandStore>> {
    match config.storage_type {
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            use std::str::FromStr;
            use std::time::Duration;

            use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

            let path = &config.sqlite.path;
            info!(path = %path, "Storage: sqlite");

            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::Unavailable(format!("cannot create {}: {e}", parent.display()))
                    })?;
                }
            }

            let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(config.connect_timeout_secs));

            let pool = SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
                .connect_with(options)
                .await?;

            let store = SqliteCommandStore::new(pool);
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err(StorageError::UnsupportedBackend("sqlite".to_string()))
        }
        #[cfg(feature = "postgres")]
        StorageType::Postgres => {
            use std::time::Duration;

            use sqlx::postgres::PgPoolOptions;

            info!("Storage: postgres");

            let pool = crate::utils::bootstrap::connect_with_retry("postgres", || {
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
                    .connect(&config.postgres.uri)
            })
            .await?;

            let store = PostgresCommandStore::new(pool);
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StorageType::Postgres => {
            tracing::error!("PostgreSQL storage requested but 'postgres' feature is not enabled");
            Err(StorageError::UnsupportedBackend("postgres".to_string()))
        }
    }
}
