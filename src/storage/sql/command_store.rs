//! Unified SQL CommandStore implementation.
//!
//! Uses a macro to generate implementations for each SQL backend,
//! eliminating code duplication while maintaining type safety.
//!
//! Every outbox mutation is a single `UPDATE ... WHERE` whose predicate
//! carries the caller's fence; `rows_affected() == 0` is the lost-race signal.

use std::marker::PhantomData;

use sea_query::{Cond, Expr, Query, SimpleExpr};

use super::SqlDatabase;
use crate::model::{ClaimFence, OutboxStatus};
use crate::storage::schema::{Commands, OutboxEvents};
use crate::storage::StorageError;

/// SQL-based implementation of CommandStore.
///
/// This generic implementation works with any SQL database that implements
/// the `SqlDatabase` trait (PostgreSQL, SQLite).
pub struct SqlCommandStore<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlCommandStore<DB> {
    /// Create a new SQL command store with the given pool.
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &DB::Pool {
        &self.pool
    }
}

const COMMAND_COLUMNS: [Commands; 8] = [
    Commands::Id,
    Commands::IdempotencyKey,
    Commands::CommandType,
    Commands::Payload,
    Commands::Status,
    Commands::LastError,
    Commands::CreatedAt,
    Commands::UpdatedAt,
];

const OUTBOX_COLUMNS: [OutboxEvents; 13] = [
    OutboxEvents::Id,
    OutboxEvents::CommandId,
    OutboxEvents::Topic,
    OutboxEvents::MessageKey,
    OutboxEvents::Payload,
    OutboxEvents::Status,
    OutboxEvents::ClaimedBy,
    OutboxEvents::LeaseExpiresAt,
    OutboxEvents::AvailableAt,
    OutboxEvents::Attempts,
    OutboxEvents::LastError,
    OutboxEvents::CreatedAt,
    OutboxEvents::PublishedAt,
];

/// Rows claimable at `now_ms`: pending and due, or claimed with a lapsed lease.
fn claimable_at(now_ms: i64) -> Cond {
    Cond::any()
        .add(
            Cond::all()
                .add(Expr::col(OutboxEvents::Status).eq(OutboxStatus::Pending.as_str()))
                .add(Expr::col(OutboxEvents::AvailableAt).lte(now_ms)),
        )
        .add(
            Cond::all()
                .add(Expr::col(OutboxEvents::Status).eq(OutboxStatus::Claimed.as_str()))
                .add(Expr::col(OutboxEvents::LeaseExpiresAt).lt(now_ms)),
        )
}

/// Row `id` still in the state captured by `fence`.
fn fenced(id: uuid::Uuid, fence: ClaimFence) -> Cond {
    Cond::all()
        .add(Expr::col(OutboxEvents::Id).eq(id.to_string()))
        .add(Expr::col(OutboxEvents::Status).eq(fence.status.as_str()))
        .add(Expr::col(OutboxEvents::Attempts).eq(fence.attempts))
}

fn null_text() -> SimpleExpr {
    Option::<String>::None.into()
}

fn null_millis() -> SimpleExpr {
    Option::<i64>::None.into()
}

/// Single-row select over `commands` matching `filter`, rendered for `DB`.
fn command_select<DB: SqlDatabase>(filter: SimpleExpr) -> String {
    DB::build_select(
        Query::select()
            .columns(COMMAND_COLUMNS)
            .from(Commands::Table)
            .and_where(filter)
            .to_owned(),
    )
}

fn insert_error(err: sqlx::Error, idempotency_key: &str) -> StorageError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::DuplicateKey(idempotency_key.to_string())
        }
        _ => StorageError::Database(err),
    }
}

/// Macro to implement CommandStore for a specific SQL backend.
///
/// This eliminates duplication between PostgreSQL and SQLite implementations
/// while maintaining full type safety.
macro_rules! impl_command_store {
    ($db_type:ty, $row_type:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        impl SqlCommandStore<$db_type> {
            /// Create tables and indexes if they do not exist.
            pub async fn init(&self) -> crate::storage::Result<()> {
                use crate::storage::schema;

                let mut statements = vec![
                    <$db_type>::build_table(schema::create_commands_table()),
                    <$db_type>::build_table(schema::create_outbox_table()),
                ];
                statements.extend(
                    schema::create_outbox_indexes()
                        .into_iter()
                        .map(<$db_type>::build_index),
                );

                for sql in statements {
                    sqlx::query(&sql).execute(&self.pool).await?;
                }
                Ok(())
            }

            fn command_from_row(row: &$row_type) -> crate::storage::Result<crate::model::Command> {
                use sqlx::Row;

                use crate::storage::from_millis;

                let id: String = row.try_get("id")?;
                let payload: String = row.try_get("payload")?;
                let status: String = row.try_get("status")?;

                Ok(crate::model::Command {
                    id: uuid::Uuid::parse_str(&id)?,
                    idempotency_key: row.try_get("idempotency_key")?,
                    command_type: row.try_get("command_type")?,
                    payload: serde_json::from_str(&payload)?,
                    status: status.parse()?,
                    last_error: row.try_get("last_error")?,
                    created_at: from_millis(row.try_get("created_at")?)?,
                    updated_at: from_millis(row.try_get("updated_at")?)?,
                })
            }

            fn event_from_row(row: &$row_type) -> crate::storage::Result<crate::model::OutboxEvent> {
                use sqlx::Row;

                use crate::storage::from_millis;

                let id: String = row.try_get("id")?;
                let command_id: String = row.try_get("command_id")?;
                let status: String = row.try_get("status")?;
                let lease_expires_at: Option<i64> = row.try_get("lease_expires_at")?;
                let published_at: Option<i64> = row.try_get("published_at")?;

                Ok(crate::model::OutboxEvent {
                    id: uuid::Uuid::parse_str(&id)?,
                    command_id: uuid::Uuid::parse_str(&command_id)?,
                    topic: row.try_get("topic")?,
                    message_key: row.try_get("message_key")?,
                    payload: row.try_get("payload")?,
                    status: status.parse()?,
                    claimed_by: row.try_get("claimed_by")?,
                    lease_expires_at: lease_expires_at.map(from_millis).transpose()?,
                    available_at: from_millis(row.try_get("available_at")?)?,
                    attempts: row.try_get("attempts")?,
                    last_error: row.try_get("last_error")?,
                    created_at: from_millis(row.try_get("created_at")?)?,
                    published_at: published_at.map(from_millis).transpose()?,
                })
            }

            // Helpers take rendered SQL: sea-query statements are not `Send`
            // and must not live across an await.
            async fn fetch_command(
                &self,
                sql: String,
            ) -> crate::storage::Result<Option<crate::model::Command>> {
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                row.as_ref().map(Self::command_from_row).transpose()
            }

            async fn fetch_events(
                &self,
                sql: String,
            ) -> crate::storage::Result<Vec<crate::model::OutboxEvent>> {
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                rows.iter().map(Self::event_from_row).collect()
            }

            async fn execute_update(&self, sql: String) -> crate::storage::Result<bool> {
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected() > 0)
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::storage::CommandStore for SqlCommandStore<$db_type> {
            async fn insert_command(
                &self,
                command: &crate::model::Command,
                event: &crate::model::OutboxEvent,
            ) -> crate::storage::Result<()> {
                use crate::storage::to_millis;

                let command_sql = <$db_type>::build_insert(
                    Query::insert()
                        .into_table(Commands::Table)
                        .columns(COMMAND_COLUMNS)
                        .values_panic([
                            command.id.to_string().into(),
                            command.idempotency_key.as_str().into(),
                            command.command_type.as_str().into(),
                            serde_json::to_string(&command.payload)?.into(),
                            command.status.as_str().into(),
                            command.last_error.clone().into(),
                            to_millis(command.created_at).into(),
                            to_millis(command.updated_at).into(),
                        ])
                        .to_owned(),
                );

                let event_sql = <$db_type>::build_insert(
                    Query::insert()
                        .into_table(OutboxEvents::Table)
                        .columns(OUTBOX_COLUMNS)
                        .values_panic([
                            event.id.to_string().into(),
                            event.command_id.to_string().into(),
                            event.topic.as_str().into(),
                            event.message_key.as_str().into(),
                            event.payload.as_str().into(),
                            event.status.as_str().into(),
                            event.claimed_by.clone().into(),
                            event.lease_expires_at.map(to_millis).into(),
                            to_millis(event.available_at).into(),
                            event.attempts.into(),
                            event.last_error.clone().into(),
                            to_millis(event.created_at).into(),
                            event.published_at.map(to_millis).into(),
                        ])
                        .to_owned(),
                );

                // Dropping the transaction on any error rolls both rows back.
                let mut tx = self.pool.begin().await?;

                sqlx::query(&command_sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| insert_error(e, &command.idempotency_key))?;

                sqlx::query(&event_sql)
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok(())
            }

            async fn find_command(
                &self,
                id: uuid::Uuid,
            ) -> crate::storage::Result<Option<crate::model::Command>> {
                let sql = command_select::<$db_type>(Expr::col(Commands::Id).eq(id.to_string()));
                self.fetch_command(sql).await
            }

            async fn find_command_by_key(
                &self,
                idempotency_key: &str,
            ) -> crate::storage::Result<Option<crate::model::Command>> {
                let sql =
                    command_select::<$db_type>(Expr::col(Commands::IdempotencyKey).eq(idempotency_key));
                self.fetch_command(sql).await
            }

            async fn update_command_status(
                &self,
                id: uuid::Uuid,
                status: crate::model::CommandStatus,
                error: Option<&str>,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<bool> {
                use crate::model::CommandStatus;
                use crate::storage::to_millis;

                let sql = <$db_type>::build_update(
                    Query::update()
                        .table(Commands::Table)
                        .value(Commands::Status, status.as_str())
                        .value(Commands::LastError, error.map(str::to_string))
                        .value(Commands::UpdatedAt, to_millis(now))
                        .and_where(Expr::col(Commands::Id).eq(id.to_string()))
                        .and_where(Expr::col(Commands::Status).eq(CommandStatus::Pending.as_str()))
                        .to_owned(),
                );

                self.execute_update(sql).await
            }

            async fn find_event(
                &self,
                id: uuid::Uuid,
            ) -> crate::storage::Result<Option<crate::model::OutboxEvent>> {
                let sql = <$db_type>::build_select(
                    Query::select()
                        .columns(OUTBOX_COLUMNS)
                        .from(OutboxEvents::Table)
                        .and_where(Expr::col(OutboxEvents::Id).eq(id.to_string()))
                        .to_owned(),
                );

                Ok(self.fetch_events(sql).await?.into_iter().next())
            }

            async fn events_for_command(
                &self,
                command_id: uuid::Uuid,
            ) -> crate::storage::Result<Vec<crate::model::OutboxEvent>> {
                use sea_query::Order;

                let sql = <$db_type>::build_select(
                    Query::select()
                        .columns(OUTBOX_COLUMNS)
                        .from(OutboxEvents::Table)
                        .and_where(Expr::col(OutboxEvents::CommandId).eq(command_id.to_string()))
                        .order_by(OutboxEvents::CreatedAt, Order::Asc)
                        .to_owned(),
                );

                self.fetch_events(sql).await
            }

            async fn claimable_events(
                &self,
                now: chrono::DateTime<chrono::Utc>,
                limit: u32,
            ) -> crate::storage::Result<Vec<crate::model::OutboxEvent>> {
                use sea_query::Order;

                use crate::storage::to_millis;

                let sql = <$db_type>::build_select(
                    Query::select()
                        .columns(OUTBOX_COLUMNS)
                        .from(OutboxEvents::Table)
                        .cond_where(claimable_at(to_millis(now)))
                        .order_by(OutboxEvents::CreatedAt, Order::Asc)
                        .order_by(OutboxEvents::Id, Order::Asc)
                        .limit(u64::from(limit))
                        .to_owned(),
                );

                self.fetch_events(sql).await
            }

            async fn claim(
                &self,
                id: uuid::Uuid,
                fence: ClaimFence,
                worker_id: &str,
                lease_until: chrono::DateTime<chrono::Utc>,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<Option<crate::model::OutboxEvent>> {
                use crate::storage::to_millis;

                let sql = <$db_type>::build_update(
                    Query::update()
                        .table(OutboxEvents::Table)
                        .value(OutboxEvents::Status, OutboxStatus::Claimed.as_str())
                        .value(OutboxEvents::ClaimedBy, worker_id)
                        .value(OutboxEvents::LeaseExpiresAt, to_millis(lease_until))
                        .value(
                            OutboxEvents::Attempts,
                            Expr::col(OutboxEvents::Attempts).add(1),
                        )
                        .cond_where(fenced(id, fence).add(claimable_at(to_millis(now))))
                        .returning(Query::returning().columns(OUTBOX_COLUMNS))
                        .to_owned(),
                );

                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                row.as_ref().map(Self::event_from_row).transpose()
            }

            async fn mark_published(
                &self,
                id: uuid::Uuid,
                fence: ClaimFence,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<bool> {
                use crate::storage::to_millis;

                let sql = <$db_type>::build_update(
                    Query::update()
                        .table(OutboxEvents::Table)
                        .value(OutboxEvents::Status, OutboxStatus::Published.as_str())
                        .value(OutboxEvents::PublishedAt, to_millis(now))
                        .value(OutboxEvents::ClaimedBy, null_text())
                        .value(OutboxEvents::LeaseExpiresAt, null_millis())
                        .cond_where(fenced(id, fence))
                        .to_owned(),
                );

                self.execute_update(sql).await
            }

            async fn release(
                &self,
                id: uuid::Uuid,
                fence: ClaimFence,
                available_at: chrono::DateTime<chrono::Utc>,
                error: &str,
            ) -> crate::storage::Result<bool> {
                use crate::storage::to_millis;

                let sql = <$db_type>::build_update(
                    Query::update()
                        .table(OutboxEvents::Table)
                        .value(OutboxEvents::Status, OutboxStatus::Pending.as_str())
                        .value(OutboxEvents::ClaimedBy, null_text())
                        .value(OutboxEvents::LeaseExpiresAt, null_millis())
                        .value(OutboxEvents::AvailableAt, to_millis(available_at))
                        .value(OutboxEvents::LastError, error)
                        .cond_where(fenced(id, fence))
                        .to_owned(),
                );

                self.execute_update(sql).await
            }

            async fn mark_failed(
                &self,
                id: uuid::Uuid,
                fence: ClaimFence,
                error: &str,
            ) -> crate::storage::Result<bool> {
                let sql = <$db_type>::build_update(
                    Query::update()
                        .table(OutboxEvents::Table)
                        .value(OutboxEvents::Status, OutboxStatus::Failed.as_str())
                        .value(OutboxEvents::ClaimedBy, null_text())
                        .value(OutboxEvents::LeaseExpiresAt, null_millis())
                        .value(OutboxEvents::LastError, error)
                        .cond_where(fenced(id, fence))
                        .to_owned(),
                );

                self.execute_update(sql).await
            }

            async fn outbox_stats(&self) -> crate::storage::Result<crate::model::OutboxStats> {
                use sea_query::{Alias, Func};
                use sqlx::Row;

                let sql = <$db_type>::build_select(
                    Query::select()
                        .column(OutboxEvents::Status)
                        .expr_as(Func::count(Expr::col(OutboxEvents::Id)), Alias::new("total"))
                        .from(OutboxEvents::Table)
                        .group_by_col(OutboxEvents::Status)
                        .to_owned(),
                );

                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

                let mut stats = crate::model::OutboxStats::default();
                for row in rows {
                    let status: String = row.try_get("status")?;
                    let total: i64 = row.try_get("total")?;
                    stats.add(status.parse()?, total.max(0) as u64);
                }
                Ok(stats)
            }
        }
    };
}

// Generate implementations for each SQL backend
impl_command_store!(super::postgres::Postgres, sqlx::postgres::PgRow, "postgres");
impl_command_store!(super::sqlite::Sqlite, sqlx::sqlite::SqliteRow, "sqlite");
