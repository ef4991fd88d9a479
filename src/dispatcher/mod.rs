//! Outbox claim dispatcher.
//!
//! Any number of dispatchers, in one process or many, share the store. Each
//! iteration selects claimable rows, leases each one with a conditional
//! update, publishes it and records the outcome under the claim's fence.
//! The store's compare-and-set is the only coordination between dispatchers.
//!
//! Delivery is at-least-once: a crash between broker acceptance and
//! `mark_published` leaves the lease to expire and the row is published
//! again. Consumers deduplicate on the outbox event id carried in every
//! message.

mod task;

pub use task::{spawn_pool, DispatcherHandle};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::dlq::{DeadLetter, DeadLetterNotifier, LogDeadLetterNotifier};
use crate::model::{now, OutboxEvent};
use crate::publisher::BrokerPublisher;
use crate::storage::{CommandStore, StorageError};
use crate::utils::retry::outbox_retry_delay;

/// Errors that abort a dispatcher iteration.
///
/// Publish failures never surface here; they are recorded on the row.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Per-dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Unique identity recorded in `claimed_by`.
    pub worker_id: String,
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub max_attempts: i32,
    pub retry_backoff_initial: Duration,
    pub retry_backoff_max: Duration,
}

impl DispatcherSettings {
    pub fn from_config(config: &DispatcherConfig, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
            lease: config.lease(),
            max_attempts: config.max_attempts.max(1),
            retry_backoff_initial: config.retry_backoff_initial(),
            retry_backoff_max: config.retry_backoff_max(),
        }
    }

    /// `{prefix}-{index}-{uuid}`, unique across processes.
    pub fn worker_id_for(prefix: &str, index: usize) -> String {
        format!("{prefix}-{index}-{}", Uuid::new_v4().simple())
    }
}

/// What happened to one candidate row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Claimed, accepted by the broker, marked `PUBLISHED`.
    Published,
    /// Claimed, publish failed, returned to `PENDING` for retry.
    Released,
    /// Moved to `FAILED` after exhausting its attempts.
    DeadLettered,
    /// Another dispatcher changed the row first; nothing was written.
    LostRace,
    /// Our outcome write was fenced out because the lease was taken over.
    Stale,
    /// The row was not claimable.
    Skipped,
}

/// Tally of one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub candidates: usize,
    pub claimed: usize,
    pub lost_races: usize,
    pub published: usize,
    pub released: usize,
    pub dead_lettered: usize,
    pub stale: usize,
    /// The candidate query returned a full batch; more work is likely waiting.
    pub batch_full: bool,
}

impl DispatchReport {
    fn record(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Published => self.published += 1,
            EventOutcome::Released => self.released += 1,
            EventOutcome::DeadLettered => self.dead_lettered += 1,
            EventOutcome::LostRace => self.lost_races += 1,
            EventOutcome::Stale => self.stale += 1,
            EventOutcome::Skipped => {}
        }
    }

    pub fn is_idle(&self) -> bool {
        self.candidates == 0
    }
}

fn after(start: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One claim dispatcher.
pub struct Dispatcher {
    store: Arc<dyn CommandStore>,
    publisher: Arc<dyn BrokerPublisher>,
    notifier: Arc<dyn DeadLetterNotifier>,
    settings: DispatcherSettings,
    wakeup: Option<Arc<Notify>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn CommandStore>,
        publisher: Arc<dyn BrokerPublisher>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            publisher,
            notifier: Arc::new(LogDeadLetterNotifier),
            settings,
            wakeup: None,
        }
    }

    /// Route dead-letter notices somewhere other than the log.
    pub fn with_notifier(mut self, notifier: Arc<dyn DeadLetterNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Cut the idle sleep short when `wakeup` fires.
    pub fn with_wakeup(mut self, wakeup: Arc<Notify>) -> Self {
        self.wakeup = Some(wakeup);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Run one claim/publish/mark iteration over a bounded batch.
    pub async fn run_once(&self) -> Result<DispatchReport> {
        let candidates = self
            .store
            .claimable_events(now(), self.settings.batch_size)
            .await?;

        let mut report = DispatchReport {
            candidates: candidates.len(),
            batch_full: candidates.len() >= self.settings.batch_size as usize,
            ..Default::default()
        };

        for candidate in candidates {
            let outcome = self.process(&candidate, &mut report).await?;
            report.record(outcome);
        }

        if !report.is_idle() {
            debug!(
                worker_id = %self.settings.worker_id,
                candidates = report.candidates,
                claimed = report.claimed,
                published = report.published,
                released = report.released,
                dead_lettered = report.dead_lettered,
                lost_races = report.lost_races,
                stale = report.stale,
                "Dispatch iteration complete"
            );
        }
        Ok(report)
    }

    /// Claim and publish a single event now, without waiting for a poll.
    ///
    /// Uses the same conditional claim as [`run_once`](Self::run_once), so it
    /// is safe to call while pollers are running.
    pub async fn dispatch_event(&self, event_id: Uuid) -> Result<EventOutcome> {
        let Some(event) = self.store.find_event(event_id).await? else {
            return Ok(EventOutcome::Skipped);
        };
        if !event.is_claimable(now()) {
            return Ok(EventOutcome::Skipped);
        }
        let mut report = DispatchReport::default();
        self.process(&event, &mut report).await
    }

    async fn process(
        &self,
        candidate: &OutboxEvent,
        report: &mut DispatchReport,
    ) -> Result<EventOutcome> {
        if candidate.attempts >= self.settings.max_attempts {
            return self.dead_letter_exhausted(candidate).await;
        }

        let claimed_at = now();
        let claimed = self
            .store
            .claim(
                candidate.id,
                candidate.fence(),
                &self.settings.worker_id,
                after(claimed_at, self.settings.lease),
                claimed_at,
            )
            .await?;

        let Some(claimed) = claimed else {
            debug!(
                worker_id = %self.settings.worker_id,
                event_id = %candidate.id,
                "Claim lost to another dispatcher"
            );
            return Ok(EventOutcome::LostRace);
        };

        report.claimed += 1;
        self.deliver(claimed).await
    }

    /// Publish a row this dispatcher holds and record the outcome.
    async fn deliver(&self, event: OutboxEvent) -> Result<EventOutcome> {
        let fence = event.fence();
        let message = event.message();

        match self.publisher.publish(&message).await {
            Ok(_) => {
                if self.store.mark_published(event.id, fence, now()).await? {
                    debug!(
                        worker_id = %self.settings.worker_id,
                        event_id = %event.id,
                        attempts = event.attempts,
                        "Outbox event published"
                    );
                    Ok(EventOutcome::Published)
                } else {
                    Ok(self.stale(&event, "mark_published"))
                }
            }
            Err(err) => {
                let error = err.to_string();
                warn!(
                    worker_id = %self.settings.worker_id,
                    publisher = self.publisher.name(),
                    event_id = %event.id,
                    attempts = event.attempts,
                    max_attempts = self.settings.max_attempts,
                    error = %error,
                    "Publish failed"
                );

                if event.attempts >= self.settings.max_attempts {
                    if self.store.mark_failed(event.id, fence, &error).await? {
                        self.report_dead_letter(&event, event.attempts, error).await;
                        Ok(EventOutcome::DeadLettered)
                    } else {
                        Ok(self.stale(&event, "mark_failed"))
                    }
                } else {
                    let delay = outbox_retry_delay(
                        event.attempts,
                        self.settings.retry_backoff_initial,
                        self.settings.retry_backoff_max,
                    );
                    let available_at = after(now(), delay);
                    if self.store.release(event.id, fence, available_at, &error).await? {
                        debug!(event_id = %event.id, retry_in = ?delay, "Outbox event released");
                        Ok(EventOutcome::Released)
                    } else {
                        Ok(self.stale(&event, "release"))
                    }
                }
            }
        }
    }

    /// Dead-letter a claimable row that already used its last attempt, e.g.
    /// because its final holder crashed.
    async fn dead_letter_exhausted(&self, candidate: &OutboxEvent) -> Result<EventOutcome> {
        let error = candidate
            .last_error
            .clone()
            .unwrap_or_else(|| "lease expired after final attempt".to_string());

        if self
            .store
            .mark_failed(candidate.id, candidate.fence(), &error)
            .await?
        {
            self.report_dead_letter(candidate, candidate.attempts, error)
                .await;
            Ok(EventOutcome::DeadLettered)
        } else {
            Ok(EventOutcome::LostRace)
        }
    }

    async fn report_dead_letter(&self, event: &OutboxEvent, attempts: i32, error: String) {
        let dead_letter =
            DeadLetter::from_event(event, attempts, error, &self.settings.worker_id, now());
        if let Err(e) = self.notifier.notify(dead_letter).await {
            warn!(event_id = %event.id, error = %e, "Dead-letter notification failed");
        }
    }

    fn stale(&self, event: &OutboxEvent, write: &str) -> EventOutcome {
        warn!(
            worker_id = %self.settings.worker_id,
            event_id = %event.id,
            attempts = event.attempts,
            write,
            "Outcome discarded: lease was taken over by another dispatcher"
        );
        EventOutcome::Stale
    }
}
