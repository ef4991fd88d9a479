//! CommandStore interface tests.
//!
//! These tests verify the contract of the CommandStore trait.
//! Each storage implementation should run these tests against one store;
//! every test uses its own idempotency keys so they can share it.

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::join_all;
use serde_json::json;
use uuid::Uuid;

use courier::model::{now, Command, CommandStatus, OutboxEvent, OutboxStatus};
use courier::storage::{CommandStore, StorageError};

fn pair_at(key: &str, at: DateTime<Utc>) -> (Command, OutboxEvent) {
    let command = Command::new(
        format!("{key}-{}", Uuid::new_v4().simple()),
        "CreateUser",
        json!({"name": key, "n": 1}),
        at,
    );
    let event = OutboxEvent::for_command(&command, "commands.CreateUser")
        .expect("envelope should serialize");
    (command, event)
}

fn pair(key: &str) -> (Command, OutboxEvent) {
    pair_at(key, now())
}

async fn seeded<S: CommandStore + ?Sized>(store: &S, key: &str) -> (Command, OutboxEvent) {
    let (command, event) = pair(key);
    store
        .insert_command(&command, &event)
        .await
        .expect("insert should succeed");
    (command, event)
}

async fn claimed<S: CommandStore + ?Sized>(
    store: &S,
    event: &OutboxEvent,
    worker: &str,
    lease_until: DateTime<Utc>,
    at: DateTime<Utc>,
) -> OutboxEvent {
    store
        .claim(event.id, event.fence(), worker, lease_until, at)
        .await
        .expect("claim should succeed")
        .expect("claim should win")
}

// =============================================================================
// Ingestion transaction
// =============================================================================

pub async fn test_insert_and_find<S: CommandStore + ?Sized>(store: &S) {
    let (command, event) = seeded(store, "test_insert").await;

    let found = store
        .find_command(command.id)
        .await
        .expect("find should succeed")
        .expect("command should exist");
    assert_eq!(found, command, "command should round-trip unchanged");

    let by_key = store
        .find_command_by_key(&command.idempotency_key)
        .await
        .unwrap()
        .expect("command should be found by key");
    assert_eq!(by_key.id, command.id);

    let stored = store
        .find_event(event.id)
        .await
        .unwrap()
        .expect("event should exist");
    assert_eq!(stored, event, "event should round-trip unchanged");
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.attempts, 0);

    let events = store.events_for_command(command.id).await.unwrap();
    assert_eq!(events.len(), 1, "one outbox event per command");
}

pub async fn test_find_missing<S: CommandStore + ?Sized>(store: &S) {
    assert!(store.find_command(Uuid::new_v4()).await.unwrap().is_none());
    assert!(store.find_event(Uuid::new_v4()).await.unwrap().is_none());
    assert!(store
        .find_command_by_key("test_no_such_key")
        .await
        .unwrap()
        .is_none());
    assert!(store
        .events_for_command(Uuid::new_v4())
        .await
        .unwrap()
        .is_empty());
}

pub async fn test_duplicate_key_writes_nothing<S: CommandStore + ?Sized>(store: &S) {
    let (first, _) = seeded(store, "test_dup").await;

    let mut second = Command::new(
        first.idempotency_key.clone(),
        "CreateUser",
        json!({"different": true}),
        now(),
    );
    second.id = Uuid::new_v4();
    let second_event = OutboxEvent::for_command(&second, "commands.CreateUser").unwrap();

    let err = store
        .insert_command(&second, &second_event)
        .await
        .expect_err("duplicate key should be rejected");
    assert!(
        matches!(&err, StorageError::DuplicateKey(key) if *key == first.idempotency_key),
        "expected DuplicateKey, got {err}"
    );

    assert!(store.find_command(second.id).await.unwrap().is_none());
    assert!(
        store.find_event(second_event.id).await.unwrap().is_none(),
        "no partial outbox row"
    );
    assert_eq!(store.events_for_command(first.id).await.unwrap().len(), 1);

    let winner = store
        .find_command_by_key(&first.idempotency_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(winner.payload, first.payload, "original payload kept");
}

pub async fn test_concurrent_duplicate_inserts<S: CommandStore + ?Sized>(store: &S) {
    let key = format!("test_race-{}", Uuid::new_v4().simple());
    let pairs: Vec<_> = (0..8)
        .map(|i| {
            let command = Command::new(key.clone(), "CreateUser", json!({"i": i}), now());
            let event = OutboxEvent::for_command(&command, "commands.CreateUser").unwrap();
            (command, event)
        })
        .collect();

    let results = join_all(pairs.iter().map(|(c, e)| store.insert_command(c, e))).await;

    let created = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(StorageError::DuplicateKey(_))))
        .count();
    assert_eq!(created, 1, "exactly one insert should commit");
    assert_eq!(duplicates, 7, "the rest should see the duplicate key");

    let winner = store.find_command_by_key(&key).await.unwrap().unwrap();
    assert_eq!(store.events_for_command(winner.id).await.unwrap().len(), 1);
}

pub async fn test_failed_outbox_insert_rolls_back_command<S: CommandStore + ?Sized>(store: &S) {
    let (first, first_event) = seeded(store, "test_rollback_first").await;

    // The command row is new; only the outbox row collides.
    let (second, mut clashing) = pair("test_rollback_second");
    clashing.id = first_event.id;

    let result = store.insert_command(&second, &clashing).await;
    assert!(result.is_err(), "outbox id collision should fail the insert");

    assert!(
        store.find_command(second.id).await.unwrap().is_none(),
        "command row should roll back with the failed outbox row"
    );
    assert!(store
        .find_command_by_key(&second.idempotency_key)
        .await
        .unwrap()
        .is_none());

    let events = store.events_for_command(first.id).await.unwrap();
    assert_eq!(events.len(), 1, "existing outbox row should be untouched");
    let kept = store.find_event(first_event.id).await.unwrap().unwrap();
    assert_eq!(kept, first_event);
}

// =============================================================================
// Claims
// =============================================================================

pub async fn test_claim_leases_and_counts_attempt<S: CommandStore + ?Sized>(store: &S) {
    let (_, event) = seeded(store, "test_claim").await;
    let t = now();
    let lease = t + Duration::seconds(30);

    let held = claimed(store, &event, "worker-a", lease, t).await;
    assert_eq!(held.status, OutboxStatus::Claimed);
    assert_eq!(held.claimed_by.as_deref(), Some("worker-a"));
    assert_eq!(held.lease_expires_at, Some(lease));
    assert_eq!(held.attempts, 1);

    let stored = store.find_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored, held, "claim should return the row as stored");
}

pub async fn test_claim_is_exclusive<S: CommandStore + ?Sized>(store: &S) {
    let (_, event) = seeded(store, "test_exclusive").await;
    let t = now();
    let lease = t + Duration::seconds(30);

    claimed(store, &event, "worker-a", lease, t).await;

    let second = store
        .claim(event.id, event.fence(), "worker-b", lease, t)
        .await
        .unwrap();
    assert!(second.is_none(), "stale fence should lose");

    let current = store.find_event(event.id).await.unwrap().unwrap();
    let third = store
        .claim(event.id, current.fence(), "worker-b", lease, t)
        .await
        .unwrap();
    assert!(third.is_none(), "an unexpired lease is not claimable");

    let candidates = store.claimable_events(t, 1000).await.unwrap();
    assert!(!candidates.iter().any(|e| e.id == event.id));
}

pub async fn test_concurrent_claims_single_winner<S: CommandStore + ?Sized>(store: &S) {
    let (_, event) = seeded(store, "test_claim_race").await;
    let t = now();
    let lease = t + Duration::seconds(30);
    let workers: Vec<String> = (0..8).map(|i| format!("worker-{i}")).collect();

    let results = join_all(
        workers
            .iter()
            .map(|w| store.claim(event.id, event.fence(), w, lease, t)),
    )
    .await;

    let winners: Vec<_> = results
        .into_iter()
        .filter_map(|r| r.expect("claim should not error"))
        .collect();
    assert_eq!(winners.len(), 1, "exactly one claim should win");

    let stored = store.find_event(event.id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.claimed_by, winners[0].claimed_by);
}

pub async fn test_expired_lease_is_reclaimable<S: CommandStore + ?Sized>(store: &S) {
    let (_, event) = seeded(store, "test_expiry").await;
    let t = now();

    let first = claimed(store, &event, "crashed", t + Duration::seconds(1), t).await;

    let later = t + Duration::seconds(2);
    let candidates = store.claimable_events(later, 1000).await.unwrap();
    assert!(candidates.iter().any(|e| e.id == event.id));

    let second = claimed(store, &first, "rescuer", later + Duration::seconds(30), later).await;
    assert_eq!(second.attempts, 2);
    assert_eq!(second.claimed_by.as_deref(), Some("rescuer"));
}

pub async fn test_available_at_gates_claims<S: CommandStore + ?Sized>(store: &S) {
    let (_, event) = seeded(store, "test_gate").await;
    let t = now();
    let held = claimed(store, &event, "worker-a", t + Duration::seconds(30), t).await;

    let retry_at = t + Duration::seconds(60);
    assert!(store
        .release(event.id, held.fence(), retry_at, "broker down")
        .await
        .unwrap());

    let released = store.find_event(event.id).await.unwrap().unwrap();
    assert_eq!(released.status, OutboxStatus::Pending);
    assert_eq!(released.available_at, retry_at);
    assert_eq!(released.attempts, 1, "release keeps the attempt count");
    assert_eq!(released.last_error.as_deref(), Some("broker down"));
    assert!(released.claimed_by.is_none());
    assert!(released.lease_expires_at.is_none());

    let early = store
        .claim(event.id, released.fence(), "worker-b", t + Duration::seconds(30), t)
        .await
        .unwrap();
    assert!(early.is_none(), "not claimable before available_at");
    assert!(!store
        .claimable_events(t, 1000)
        .await
        .unwrap()
        .iter()
        .any(|e| e.id == event.id));

    let due = retry_at + Duration::seconds(1);
    let again = claimed(store, &released, "worker-b", due + Duration::seconds(30), due).await;
    assert_eq!(again.attempts, 2);
}

pub async fn test_claimable_ordering_and_limit<S: CommandStore + ?Sized>(store: &S) {
    // Older than anything the other tests insert, so these come first.
    let base = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    let mut ids = Vec::new();
    for i in 0..3 {
        let (command, event) = pair_at("test_order", base + Duration::seconds(i));
        store.insert_command(&command, &event).await.unwrap();
        ids.push(event.id);
    }

    let first_two = store.claimable_events(now(), 2).await.unwrap();
    assert_eq!(first_two.len(), 2, "limit should bound the batch");
    assert_eq!(
        first_two.iter().map(|e| e.id).collect::<Vec<_>>(),
        ids[..2].to_vec(),
        "oldest first"
    );

    let all = store.claimable_events(now(), 3).await.unwrap();
    assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), ids);
}

// =============================================================================
// Fenced outcome writes
// =============================================================================

pub async fn test_outcome_writes_are_fenced<S: CommandStore + ?Sized>(store: &S) {
    let (_, event) = seeded(store, "test_fence").await;
    let t = now();

    let slow = claimed(store, &event, "slow", t + Duration::seconds(1), t).await;
    let later = t + Duration::seconds(2);
    let fast = claimed(store, &slow, "fast", later + Duration::seconds(30), later).await;

    assert!(!store.mark_published(event.id, slow.fence(), later).await.unwrap());
    assert!(!store
        .release(event.id, slow.fence(), later, "late")
        .await
        .unwrap());
    assert!(!store.mark_failed(event.id, slow.fence(), "late").await.unwrap());

    let untouched = store.find_event(event.id).await.unwrap().unwrap();
    assert_eq!(untouched, fast, "stale writes should change nothing");

    assert!(store.mark_published(event.id, fast.fence(), later).await.unwrap());
    let published = store.find_event(event.id).await.unwrap().unwrap();
    assert_eq!(published.status, OutboxStatus::Published);
    assert_eq!(published.published_at, Some(later));
    assert!(published.claimed_by.is_none());
    assert!(published.lease_expires_at.is_none());

    assert!(
        !store.mark_published(event.id, fast.fence(), later).await.unwrap(),
        "a fence matches only once"
    );
}

pub async fn test_published_is_terminal<S: CommandStore + ?Sized>(store: &S) {
    let (_, event) = seeded(store, "test_terminal_pub").await;
    let t = now();
    let held = claimed(store, &event, "worker-a", t + Duration::seconds(1), t).await;
    assert!(store.mark_published(event.id, held.fence(), t).await.unwrap());

    let published = store.find_event(event.id).await.unwrap().unwrap();
    let far = t + Duration::days(365);
    assert!(store
        .claim(event.id, published.fence(), "worker-b", far, far)
        .await
        .unwrap()
        .is_none());
    assert!(!store
        .claimable_events(far, 1000)
        .await
        .unwrap()
        .iter()
        .any(|e| e.id == event.id));
}

pub async fn test_mark_failed_is_terminal<S: CommandStore + ?Sized>(store: &S) {
    let (_, event) = seeded(store, "test_terminal_fail").await;
    let t = now();
    let held = claimed(store, &event, "worker-a", t + Duration::seconds(1), t).await;

    assert!(store
        .mark_failed(event.id, held.fence(), "rejected by broker")
        .await
        .unwrap());

    let failed = store.find_event(event.id).await.unwrap().unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("rejected by broker"));
    assert!(failed.claimed_by.is_none());

    let far = t + Duration::days(365);
    assert!(store
        .claim(event.id, failed.fence(), "worker-b", far, far)
        .await
        .unwrap()
        .is_none());
}

pub async fn test_mark_failed_on_expired_claim<S: CommandStore + ?Sized>(store: &S) {
    let (_, event) = seeded(store, "test_fail_expired").await;
    let t = now();
    let held = claimed(store, &event, "crashed", t + Duration::seconds(1), t).await;

    // Dead-lettering an abandoned row uses the fence observed while scanning.
    assert!(store
        .mark_failed(event.id, held.fence(), "lease expired after final attempt")
        .await
        .unwrap());
    let failed = store.find_event(event.id).await.unwrap().unwrap();
    assert_eq!(failed.status, OutboxStatus::Failed);
    assert_eq!(failed.attempts, 1);
}

// =============================================================================
// Command status and stats
// =============================================================================

pub async fn test_update_command_status<S: CommandStore + ?Sized>(store: &S) {
    let (done, _) = seeded(store, "test_status_done").await;
    let (failed, _) = seeded(store, "test_status_failed").await;
    let t = now() + Duration::seconds(5);

    assert!(store
        .update_command_status(done.id, CommandStatus::Completed, None, t)
        .await
        .unwrap());
    let stored = store.find_command(done.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CommandStatus::Completed);
    assert_eq!(stored.updated_at, t);

    let settled_twice = store
        .update_command_status(done.id, CommandStatus::Failed, Some("late"), t)
        .await
        .unwrap();
    assert!(!settled_twice, "only PENDING commands can be settled");
    let stored = store.find_command(done.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CommandStatus::Completed);
    assert!(stored.last_error.is_none());

    assert!(store
        .update_command_status(failed.id, CommandStatus::Failed, Some("quota"), t)
        .await
        .unwrap());
    let stored = store.find_command(failed.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CommandStatus::Failed);
    assert_eq!(stored.last_error.as_deref(), Some("quota"));

    assert!(!store
        .update_command_status(Uuid::new_v4(), CommandStatus::Completed, None, t)
        .await
        .unwrap());
}

pub async fn test_outbox_stats<S: CommandStore + ?Sized>(store: &S) {
    let before = store.outbox_stats().await.unwrap();

    seeded(store, "test_stats_pending").await;
    let (_, to_claim) = seeded(store, "test_stats_claimed").await;
    let (_, to_publish) = seeded(store, "test_stats_published").await;
    let t = now();
    let lease = t + Duration::seconds(30);

    claimed(store, &to_claim, "worker-a", lease, t).await;
    let held = claimed(store, &to_publish, "worker-a", lease, t).await;
    assert!(store.mark_published(to_publish.id, held.fence(), t).await.unwrap());

    let after = store.outbox_stats().await.unwrap();
    assert_eq!(after.pending, before.pending + 1);
    assert_eq!(after.claimed, before.claimed + 1);
    assert_eq!(after.published, before.published + 1);
    assert_eq!(after.failed, before.failed);
    assert_eq!(after.total(), before.total() + 3);
}

/// Run all CommandStore tests against a store implementation.
#[macro_export]
macro_rules! run_command_store_tests {
    ($store:expr) => {
        use $crate::storage::command_store_tests::*;

        // ingestion
        test_insert_and_find($store).await;
        println!("  test_insert_and_find: PASSED");

        test_find_missing($store).await;
        println!("  test_find_missing: PASSED");

        test_duplicate_key_writes_nothing($store).await;
        println!("  test_duplicate_key_writes_nothing: PASSED");

        test_concurrent_duplicate_inserts($store).await;
        println!("  test_concurrent_duplicate_inserts: PASSED");

        test_failed_outbox_insert_rolls_back_command($store).await;
        println!("  test_failed_outbox_insert_rolls_back_command: PASSED");

        // claims
        test_claim_leases_and_counts_attempt($store).await;
        println!("  test_claim_leases_and_counts_attempt: PASSED");

        test_claim_is_exclusive($store).await;
        println!("  test_claim_is_exclusive: PASSED");

        test_concurrent_claims_single_winner($store).await;
        println!("  test_concurrent_claims_single_winner: PASSED");

        test_expired_lease_is_reclaimable($store).await;
        println!("  test_expired_lease_is_reclaimable: PASSED");

        test_available_at_gates_claims($store).await;
        println!("  test_available_at_gates_claims: PASSED");

        test_claimable_ordering_and_limit($store).await;
        println!("  test_claimable_ordering_and_limit: PASSED");

        // outcome writes
        test_outcome_writes_are_fenced($store).await;
        println!("  test_outcome_writes_are_fenced: PASSED");

        test_published_is_terminal($store).await;
        println!("  test_published_is_terminal: PASSED");

        test_mark_failed_is_terminal($store).await;
        println!("  test_mark_failed_is_terminal: PASSED");

        test_mark_failed_on_expired_claim($store).await;
        println!("  test_mark_failed_on_expired_claim: PASSED");

        // status and stats
        test_update_command_status($store).await;
        println!("  test_update_command_status: PASSED");

        test_outbox_stats($store).await;
        println!("  test_outbox_stats: PASSED");
    };
}
