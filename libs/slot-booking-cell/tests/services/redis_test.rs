// Runs against a live server only when REDIS_TEST_URL is set; otherwise each
// test returns immediately.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Duration as ChronoDuration;
use futures::future::join_all;
use redis::AsyncCommands;
use tokio::sync::Notify;
use uuid::Uuid;

use slot_booking_cell::*;
use super::{base_time, day_window, RedisTestUtils};

fn slot_at(doctor_id: Uuid, offset_hours: i64) -> Slot {
    let start = base_time() + ChronoDuration::hours(offset_hours);
    Slot::new(doctor_id, start, start + ChronoDuration::minutes(30)).unwrap()
}

fn coordinator(utils: &RedisTestUtils, store: Arc<RedisSlotStore>) -> Arc<BookingCoordinator> {
    let config = BookingConfig::default();
    let cache = Arc::new(AvailabilityCache::new(store.clone(), &config));
    Arc::new(BookingCoordinator::new(
        store,
        utils.lock_manager(),
        cache,
        Arc::new(Notify::new()),
        config,
    ))
}

#[tokio::test]
async fn test_redis_store_round_trips_slots() {
    let Some(utils) = RedisTestUtils::new().await else { return };
    let store = utils.store();
    let doctor_id = Uuid::new_v4();
    let slot = slot_at(doctor_id, 0);

    store.import_slot(slot.clone()).await.unwrap();
    store.import_slot(slot_at(doctor_id, 2)).await.unwrap();
    store.import_slot(slot_at(doctor_id, 30)).await.unwrap();

    assert_eq!(store.get_slot(slot.id).await.unwrap(), Some(slot.clone()));
    assert_matches!(store.import_slot(slot).await, Err(BookingError::ValidationError(_)));
    assert_eq!(store.list_slots(doctor_id, &day_window()).await.unwrap().len(), 2);

    utils.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redis_concurrent_bookings_commit_once() {
    let Some(utils) = RedisTestUtils::new().await else { return };
    let store = utils.store();
    let coordinator = coordinator(&utils, store.clone());
    let slot = slot_at(Uuid::new_v4(), 0);
    store.import_slot(slot.clone()).await.unwrap();

    let attempts = (0..8).map(|_| {
        let coordinator = coordinator.clone();
        let slot_id = slot.id;
        tokio::spawn(async move { coordinator.book(Uuid::new_v4(), slot_id).await })
    });
    let committed = join_all(attempts)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();

    assert_eq!(committed, 1);
    let stored = store.get_slot(slot.id).await.unwrap().unwrap();
    assert!(stored.is_booked());
    assert_eq!(stored.version(), 1);
    assert_eq!(store.outbox_depth().await.unwrap(), 1);

    utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_lifecycle_releases_and_rebooks() {
    let Some(utils) = RedisTestUtils::new().await else { return };
    let store = utils.store();
    let coordinator = coordinator(&utils, store.clone());
    let slot = slot_at(Uuid::new_v4(), 0);
    store.import_slot(slot.clone()).await.unwrap();
    let patient_id = Uuid::new_v4();

    let first = coordinator.book(patient_id, slot.id).await.unwrap();
    coordinator.cancel(first.id, Actor::Patient(patient_id)).await.unwrap();
    assert_eq!(store.get_slot(slot.id).await.unwrap().unwrap().version(), 2);

    let second = coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();
    coordinator.confirm(second.id).await.unwrap();
    coordinator.complete(second.id).await.unwrap();
    assert_matches!(
        coordinator.confirm(second.id).await,
        Err(BookingError::AlreadyTerminal { .. })
    );

    let history = store.appointments_for_slot(slot.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|a| a.is_live()).count(), 1);
    assert!(store.find_orphaned_reservations().await.unwrap().is_empty());

    utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_lock_expires_and_checks_token() {
    let Some(utils) = RedisTestUtils::new().await else { return };
    let locks = utils.lock_manager();
    let slot_id = Uuid::new_v4();
    let ttl = Duration::from_millis(200);

    let stale = match locks.acquire(slot_id, ttl).await.unwrap() {
        LockAcquisition::Acquired(token) => token,
        LockAcquisition::Busy => panic!("fresh lock should be granted"),
    };
    assert_matches!(locks.acquire(slot_id, ttl).await.unwrap(), LockAcquisition::Busy);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let current = locks.acquire(slot_id, Duration::from_secs(5)).await.unwrap();
    assert_matches!(current, LockAcquisition::Acquired(_));

    assert_eq!(locks.release(slot_id, &stale).await.unwrap(), LockRelease::AlreadyExpired);
    assert_matches!(locks.acquire(slot_id, ttl).await.unwrap(), LockAcquisition::Busy);

    utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_orphan_sweep() {
    let Some(utils) = RedisTestUtils::new().await else { return };
    let store = utils.store();
    let doctor_id = Uuid::new_v4();
    let start = base_time();
    let orphan = Slot::from_parts(
        Uuid::new_v4(),
        doctor_id,
        start,
        start + ChronoDuration::minutes(30),
        true,
        5,
    )
    .unwrap();
    store.import_slot(orphan.clone()).await.unwrap();

    let cache = Arc::new(AvailabilityCache::new(store.clone(), &BookingConfig::default()));
    let consistency = ConsistencyService::new(store.clone(), utils.lock_manager(), cache, &BookingConfig::default());

    let report = consistency.sweep().await.unwrap();

    assert_eq!(report.orphans_released, 1);
    let repaired = store.get_slot(orphan.id).await.unwrap().unwrap();
    assert!(!repaired.is_booked());
    assert_eq!(repaired.version(), 6);

    utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_publisher_pushes_json() {
    let Some(utils) = RedisTestUtils::new().await else { return };
    let store = utils.store();
    let coordinator = coordinator(&utils, store.clone());
    let slot = slot_at(Uuid::new_v4(), 0);
    store.import_slot(slot.clone()).await.unwrap();
    let appointment = coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();

    let publisher = Arc::new(RedisEventPublisher::new(utils.pool.clone(), utils.keys.clone()));
    let dispatcher = OutboxDispatcher::new(
        store.clone(),
        publisher,
        Arc::new(Notify::new()),
        &BookingConfig::default(),
    );
    assert_eq!(dispatcher.dispatch_pending().await.unwrap().delivered, 1);
    assert_eq!(store.outbox_depth().await.unwrap(), 0);

    let mut conn = utils.pool.get().await.unwrap();
    let payload: Option<String> = conn.rpop(utils.keys.outbound_events(), None).await.unwrap();
    let record: OutboxRecord = serde_json::from_str(&payload.unwrap()).unwrap();
    assert_eq!(record.event.appointment_id(), appointment.id);

    utils.cleanup().await;
}

#[tokio::test]
async fn test_redis_failure_record_never_revives_dispatched_event() {
    let Some(utils) = RedisTestUtils::new().await else { return };
    let store = utils.store();
    let coordinator = coordinator(&utils, store.clone());
    let slot = slot_at(Uuid::new_v4(), 0);
    store.import_slot(slot.clone()).await.unwrap();
    coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();

    let record = store.pending_outbox(10).await.unwrap().remove(0);
    store.record_delivery_failure(record.id, "broker down").await.unwrap();
    let retried = store.pending_outbox(10).await.unwrap().remove(0);
    assert_eq!(retried.attempts, 1);
    assert_eq!(retried.last_error.as_deref(), Some("broker down"));

    // Another instance took the record off the pending index first.
    let mut conn = utils.pool.get().await.unwrap();
    let _: () = conn.zrem(utils.keys.outbox_pending(), record.id.to_string()).await.unwrap();
    store.record_delivery_failure(record.id, "late failure").await.unwrap();
    let payload: String = conn
        .hget(utils.keys.outbox_records(), record.id.to_string())
        .await
        .unwrap();
    let untouched: OutboxRecord = serde_json::from_str(&payload).unwrap();
    assert_eq!(untouched.attempts, 1);

    store.mark_dispatched(&[record.id]).await.unwrap();
    store.record_delivery_failure(record.id, "after dispatch").await.unwrap();
    let revived: bool = conn
        .hexists(utils.keys.outbox_records(), record.id.to_string())
        .await
        .unwrap();
    assert!(!revived);
    assert_eq!(store.outbox_depth().await.unwrap(), 0);

    utils.cleanup().await;
}
