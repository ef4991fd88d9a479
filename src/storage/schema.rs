//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.
//! Timestamps are BIGINT Unix milliseconds, identifiers are UUID text.

use sea_query::{ColumnDef, ForeignKey, Iden, Index, IndexCreateStatement, Table, TableCreateStatement};

/// Commands table schema.
#[derive(Iden)]
pub enum Commands {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "idempotency_key"]
    IdempotencyKey,
    #[iden = "command_type"]
    CommandType,
    #[iden = "payload"]
    Payload,
    #[iden = "status"]
    Status,
    #[iden = "last_error"]
    LastError,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Outbox events table schema.
#[derive(Iden)]
pub enum OutboxEvents {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "command_id"]
    CommandId,
    #[iden = "topic"]
    Topic,
    #[iden = "message_key"]
    MessageKey,
    #[iden = "payload"]
    Payload,
    #[iden = "status"]
    Status,
    #[iden = "claimed_by"]
    ClaimedBy,
    #[iden = "lease_expires_at"]
    LeaseExpiresAt,
    #[iden = "available_at"]
    AvailableAt,
    #[iden = "attempts"]
    Attempts,
    #[iden = "last_error"]
    LastError,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "published_at"]
    PublishedAt,
}

pub fn create_commands_table() -> TableCreateStatement {
    Table::create()
        .table(Commands::Table)
        .if_not_exists()
        .col(ColumnDef::new(Commands::Id).text().not_null().primary_key())
        .col(
            ColumnDef::new(Commands::IdempotencyKey)
                .text()
                .not_null()
                .unique_key(),
        )
        .col(ColumnDef::new(Commands::CommandType).text().not_null())
        .col(ColumnDef::new(Commands::Payload).text().not_null())
        .col(ColumnDef::new(Commands::Status).text().not_null())
        .col(ColumnDef::new(Commands::LastError).text().null())
        .col(ColumnDef::new(Commands::CreatedAt).big_integer().not_null())
        .col(ColumnDef::new(Commands::UpdatedAt).big_integer().not_null())
        .to_owned()
}

pub fn create_outbox_table() -> TableCreateStatement {
    Table::create()
        .table(OutboxEvents::Table)
        .if_not_exists()
        .col(ColumnDef::new(OutboxEvents::Id).text().not_null().primary_key())
        .col(ColumnDef::new(OutboxEvents::CommandId).text().not_null())
        .col(ColumnDef::new(OutboxEvents::Topic).text().not_null())
        .col(ColumnDef::new(OutboxEvents::MessageKey).text().not_null())
        .col(ColumnDef::new(OutboxEvents::Payload).text().not_null())
        .col(ColumnDef::new(OutboxEvents::Status).text().not_null())
        .col(ColumnDef::new(OutboxEvents::ClaimedBy).text().null())
        .col(ColumnDef::new(OutboxEvents::LeaseExpiresAt).big_integer().null())
        .col(ColumnDef::new(OutboxEvents::AvailableAt).big_integer().not_null())
        .col(
            ColumnDef::new(OutboxEvents::Attempts)
                .integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(OutboxEvents::LastError).text().null())
        .col(ColumnDef::new(OutboxEvents::CreatedAt).big_integer().not_null())
        .col(ColumnDef::new(OutboxEvents::PublishedAt).big_integer().null())
        .foreign_key(
            ForeignKey::create()
                .name("fk_outbox_command")
                .from(OutboxEvents::Table, OutboxEvents::CommandId)
                .to(Commands::Table, Commands::Id),
        )
        .to_owned()
}

/// Indexes on the outbox table.
///
/// `idx_outbox_claimable` serves lease recovery, `idx_outbox_available` serves
/// pending rows waiting out their retry delay.
pub fn create_outbox_indexes() -> Vec<IndexCreateStatement> {
    vec![
        Index::create()
            .if_not_exists()
            .name("idx_outbox_claimable")
            .table(OutboxEvents::Table)
            .col(OutboxEvents::Status)
            .col(OutboxEvents::LeaseExpiresAt)
            .to_owned(),
        Index::create()
            .if_not_exists()
            .name("idx_outbox_available")
            .table(OutboxEvents::Table)
            .col(OutboxEvents::Status)
            .col(OutboxEvents::AvailableAt)
            .to_owned(),
        Index::create()
            .if_not_exists()
            .name("idx_outbox_command")
            .table(OutboxEvents::Table)
            .col(OutboxEvents::CommandId)
            .to_owned(),
    ]
}
