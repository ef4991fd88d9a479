//! Command and outbox domain types.
//!
//! A [`Command`] and its [`OutboxEvent`] are always created together in one
//! store transaction. Outbox rows then move through
//! `PENDING -> CLAIMED -> {PUBLISHED | PENDING | FAILED}`, driven only by
//! conditional updates guarded by a [`ClaimFence`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current time at the millisecond precision the store persists.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Error returned when a persisted status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

/// Lifecycle of a command as observed by downstream collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(CommandStatus::Pending),
            "COMPLETED" => Ok(CommandStatus::Completed),
            "FAILED" => Ok(CommandStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Claimed,
    Published,
    /// Dead-lettered after exhausting its attempt budget.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Claimed => "CLAIMED",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    /// `PUBLISHED` and `FAILED` rows are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "CLAIMED" => Ok(OutboxStatus::Claimed),
            "PUBLISHED" => Ok(OutboxStatus::Published),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A client command, unique per idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: Uuid,
    pub idempotency_key: String,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Command {
    /// Build a fresh `PENDING` command with a new identifier.
    pub fn new(
        idempotency_key: impl Into<String>,
        command_type: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            idempotency_key: idempotency_key.into(),
            command_type: command_type.into(),
            payload,
            status: CommandStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn receipt(&self) -> CommandReceipt {
        CommandReceipt {
            command_id: self.id,
            status: self.status,
        }
    }
}

/// An event waiting in the outbox for delivery to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub command_id: Uuid,
    pub topic: String,
    pub message_key: String,
    /// Serialized [`EventEnvelope`].
    pub payload: String,
    pub status: OutboxStatus,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest instant a `PENDING` row may be claimed (retry backoff).
    pub available_at: DateTime<Utc>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    /// Build the outbox row announcing `command`.
    pub fn for_command(
        command: &Command,
        topic: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let id = Uuid::new_v4();
        let envelope = EventEnvelope {
            event_id: id,
            command_id: command.id,
            command_type: command.command_type.clone(),
            payload: command.payload.clone(),
        };

        Ok(Self {
            id,
            command_id: command.id,
            topic: topic.into(),
            message_key: command.id.to_string(),
            payload: serde_json::to_string(&envelope)?,
            status: OutboxStatus::Pending,
            claimed_by: None,
            lease_expires_at: None,
            available_at: command.created_at,
            attempts: 0,
            last_error: None,
            created_at: command.created_at,
            published_at: None,
        })
    }

    /// Whether a dispatcher may claim this row at `now`.
    ///
    /// An expired lease counts as unclaimed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => self.available_at <= now,
            OutboxStatus::Claimed => self.lease_expires_at.is_some_and(|until| until < now),
            OutboxStatus::Published | OutboxStatus::Failed => false,
        }
    }

    /// The precondition matching this row as currently observed.
    pub fn fence(&self) -> ClaimFence {
        ClaimFence {
            status: self.status,
            attempts: self.attempts,
        }
    }

    pub fn message(&self) -> OutboxMessage {
        OutboxMessage {
            event_id: self.id,
            command_id: self.command_id,
            topic: self.topic.clone(),
            key: self.message_key.clone(),
            payload: self.payload.clone(),
            attempt: self.attempts,
        }
    }
}

/// Precondition for a conditional outbox update.
///
/// `attempts` increments on every claim, so a fence taken when a claim
/// succeeded only matches until the row is claimed again. Outcome writes from
/// a worker whose lease was taken over therefore affect zero rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimFence {
    pub status: OutboxStatus,
    pub attempts: i32,
}

/// Body delivered to the broker. Consumers deduplicate on `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub command_id: Uuid,
    pub command_type: String,
    pub payload: serde_json::Value,
}

/// What a broker adapter is asked to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub event_id: Uuid,
    pub command_id: Uuid,
    pub topic: String,
    pub key: String,
    pub payload: String,
    /// Claim attempt this delivery belongs to (1-based).
    pub attempt: i32,
}

/// Identity and status returned to the submitting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandReceipt {
    pub command_id: Uuid,
    pub status: CommandStatus,
}

/// Result of an idempotent submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// A new command and its outbox event were committed.
    Created(Command),
    /// The key was already used; nothing was written.
    AlreadyExists(Command),
}

impl SubmitOutcome {
    pub fn command(&self) -> &Command {
        match self {
            SubmitOutcome::Created(c) | SubmitOutcome::AlreadyExists(c) => c,
        }
    }

    pub fn receipt(&self) -> CommandReceipt {
        self.command().receipt()
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, SubmitOutcome::AlreadyExists(_))
    }
}

/// Row counts per outbox status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub claimed: u64,
    pub published: u64,
    pub failed: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.published + self.failed
    }

    pub(crate) fn add(&mut self, status: OutboxStatus, count: u64) {
        match status {
            OutboxStatus::Pending => self.pending += count,
            OutboxStatus::Claimed => self.claimed += count,
            OutboxStatus::Published => self.published += count,
            OutboxStatus::Failed => self.failed += count,
        }
    }
}
