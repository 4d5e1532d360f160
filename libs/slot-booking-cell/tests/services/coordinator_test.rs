use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::future::join_all;
use uuid::Uuid;

use slot_booking_cell::*;
use super::TestHarness;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_bookings_commit_exactly_once() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;

    let attempts = (0..2).map(|_| {
        let coordinator = harness.coordinator.clone();
        let slot_id = slot.id;
        tokio::spawn(async move { coordinator.book(Uuid::new_v4(), slot_id).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.expect("booking task panicked"))
        .collect();

    let winners: Vec<&Appointment> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].status, AppointmentStatus::Pending);

    for loser in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_matches!(
            loser,
            BookingError::SlotUnavailable { .. } | BookingError::SlotBusy { .. }
        );
    }

    let stored = harness.slot(slot.id).await;
    assert!(stored.is_booked());
    assert_eq!(stored.version(), 1);
    harness.assert_slot_invariant(slot.id).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_patients_racing_for_one_slot() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;

    let attempts = (0..32).map(|_| {
        let coordinator = harness.coordinator.clone();
        let slot_id = slot.id;
        tokio::spawn(async move { coordinator.book(Uuid::new_v4(), slot_id).await })
    });
    let committed = join_all(attempts)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();

    assert_eq!(committed, 1);
    assert_eq!(harness.store.appointments_for_slot(slot.id).await.unwrap().len(), 1);
    assert_eq!(harness.slot(slot.id).await.version(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_alone_prevents_double_booking_without_locks() {
    let harness = TestHarness::with_lock_manager(Arc::new(NoopLockManager), BookingConfig::default());
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;

    let attempts = (0..16).map(|_| {
        let coordinator = harness.coordinator.clone();
        let slot_id = slot.id;
        tokio::spawn(async move { coordinator.book(Uuid::new_v4(), slot_id).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.expect("booking task panicked"))
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for loser in results.iter().filter_map(|r| r.as_ref().err()) {
        // No lock means nobody is ever told the slot is busy.
        assert_matches!(loser, BookingError::SlotUnavailable { .. });
    }

    assert_eq!(harness.slot(slot.id).await.version(), 1);
    harness.assert_slot_invariant(slot.id).await;
}

#[tokio::test]
async fn test_cancel_then_rebook_bumps_version() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let first_patient = Uuid::new_v4();
    let second_patient = Uuid::new_v4();

    let first = harness.coordinator.book(first_patient, slot.id).await.unwrap();
    assert_eq!(harness.slot(slot.id).await.version(), 1);

    let cancelled = harness
        .coordinator
        .cancel(first.id, Actor::Patient(first_patient))
        .await
        .unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by, Some(Actor::Patient(first_patient)));

    let freed = harness.slot(slot.id).await;
    assert!(!freed.is_booked());
    assert_eq!(freed.version(), 2);

    let second = harness.coordinator.book(second_patient, slot.id).await.unwrap();
    assert_eq!(second.patient_id, second_patient);
    assert_eq!(harness.slot(slot.id).await.version(), 3);

    // The cancelled appointment stays on record next to the live one.
    let history = harness.store.appointments_for_slot(slot.id).await.unwrap();
    assert_eq!(history.len(), 2);
    harness.assert_slot_invariant(slot.id).await;
}

#[tokio::test]
async fn test_held_lock_reports_busy_without_touching_slot() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;

    let held = harness.locks.acquire(slot.id, Duration::from_secs(30)).await.unwrap();
    assert_matches!(held, LockAcquisition::Acquired(_));

    let result = harness.coordinator.book(Uuid::new_v4(), slot.id).await;
    assert_matches!(result, Err(BookingError::SlotBusy { slot_id }) if slot_id == slot.id);
    assert!(result.unwrap_err().is_retryable());

    let untouched = harness.slot(slot.id).await;
    assert!(!untouched.is_booked());
    assert_eq!(untouched.version(), 0);
}

#[tokio::test]
async fn test_booking_unknown_slot_is_not_found() {
    let harness = TestHarness::new();
    let missing = Uuid::new_v4();

    let result = harness.coordinator.book(Uuid::new_v4(), missing).await;

    assert_matches!(result, Err(BookingError::SlotNotFound(id)) if id == missing);
    assert_matches!(
        harness.locks.acquire(missing, Duration::from_secs(1)).await.unwrap(),
        LockAcquisition::Acquired(_)
    );
}

#[tokio::test]
async fn test_confirm_on_completed_is_already_terminal() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let appointment = harness.coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();

    harness.coordinator.confirm(appointment.id).await.unwrap();
    let completed = harness.coordinator.complete(appointment.id).await.unwrap();
    assert_eq!(completed.status, AppointmentStatus::Completed);

    let result = harness.coordinator.confirm(appointment.id).await;
    assert_matches!(
        result,
        Err(BookingError::AlreadyTerminal {
            status: AppointmentStatus::Completed
        })
    );

    // Completion keeps the slot taken.
    let stored = harness.slot(slot.id).await;
    assert!(stored.is_booked());
    assert_eq!(stored.version(), 1);
    harness.assert_slot_invariant(slot.id).await;
}

#[tokio::test]
async fn test_repeat_booking_is_rejected() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let patient_id = Uuid::new_v4();

    harness.coordinator.book(patient_id, slot.id).await.unwrap();
    let replay = harness.coordinator.book(patient_id, slot.id).await;

    assert_matches!(replay, Err(BookingError::SlotUnavailable { .. }));
    assert_eq!(harness.slot(slot.id).await.version(), 1);
    assert_eq!(harness.store.appointments_for_slot(slot.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_booking_without_payment_starts_confirmed() {
    let harness = TestHarness::with_config(BookingConfig {
        payment_required: false,
        ..BookingConfig::default()
    });
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;

    let appointment = harness.coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();

    assert_eq!(appointment.status, AppointmentStatus::Confirmed);
    assert_matches!(
        harness.coordinator.confirm(appointment.id).await,
        Err(BookingError::InvalidState {
            from: AppointmentStatus::Confirmed,
            to: AppointmentStatus::Confirmed
        })
    );
}

#[tokio::test]
async fn test_cancel_pending_releases_slot() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let appointment = harness.coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();

    let released = harness.coordinator.cancel_pending(appointment.id).await.unwrap();

    assert_eq!(released.status, AppointmentStatus::Cancelled);
    assert_eq!(released.cancelled_by, Some(Actor::PaymentSaga));
    assert!(!harness.slot(slot.id).await.is_booked());

    // A second compensation for the same payment is a no-op failure.
    assert_matches!(
        harness.coordinator.cancel_pending(appointment.id).await,
        Err(BookingError::AlreadyTerminal {
            status: AppointmentStatus::Cancelled
        })
    );
}

#[tokio::test]
async fn test_cancel_pending_leaves_confirmed_appointment() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let appointment = harness.coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();
    harness.coordinator.confirm(appointment.id).await.unwrap();

    let result = harness.coordinator.cancel_pending(appointment.id).await;

    assert_matches!(result, Err(BookingError::InvalidState { .. }));
    assert!(harness.slot(slot.id).await.is_booked());
}

#[tokio::test]
async fn test_cancel_is_rejected_after_completion() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let patient_id = Uuid::new_v4();
    let appointment = harness.coordinator.book(patient_id, slot.id).await.unwrap();
    harness.coordinator.confirm(appointment.id).await.unwrap();
    harness.coordinator.complete(appointment.id).await.unwrap();

    let result = harness.coordinator.cancel(appointment.id, Actor::Patient(patient_id)).await;

    assert_matches!(
        result,
        Err(BookingError::InvalidState {
            from: AppointmentStatus::Completed,
            to: AppointmentStatus::Cancelled
        })
    );
    assert!(harness.slot(slot.id).await.is_booked());
}

#[tokio::test]
async fn test_patient_cannot_cancel_someone_elses_appointment() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let appointment = harness.coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();

    let result = harness.coordinator.cancel(appointment.id, Actor::Patient(Uuid::new_v4())).await;
    assert_matches!(result, Err(BookingError::Forbidden { .. }));

    // The clinic may.
    let cancelled = harness.coordinator.cancel(appointment.id, Actor::Clinic).await.unwrap();
    assert_eq!(cancelled.cancelled_by, Some(Actor::Clinic));
}

#[tokio::test]
async fn test_unknown_appointment_is_not_found() {
    let harness = TestHarness::new();
    let missing = Uuid::new_v4();

    assert_matches!(
        harness.coordinator.confirm(missing).await,
        Err(BookingError::AppointmentNotFound(id)) if id == missing
    );
    assert_matches!(
        harness.coordinator.cancel(missing, Actor::System).await,
        Err(BookingError::AppointmentNotFound(_))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_confirm_and_cancel_settle_on_one_outcome() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let appointment = harness.coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();

    let confirm = {
        let coordinator = harness.coordinator.clone();
        tokio::spawn(async move { coordinator.confirm(appointment.id).await })
    };
    let cancel = {
        let coordinator = harness.coordinator.clone();
        tokio::spawn(async move { coordinator.cancel_pending(appointment.id).await })
    };
    let confirm = confirm.await.unwrap();
    let cancel = cancel.await.unwrap();

    // cancel_pending only succeeds if it ran first, and then confirm finds a terminal appointment.
    match (&confirm, &cancel) {
        (Ok(_), Err(e)) => assert_matches!(e, BookingError::InvalidState { .. }),
        (Err(e), Ok(_)) => assert_matches!(e, BookingError::AlreadyTerminal { .. }),
        other => panic!("expected exactly one winner, got {:?}", other),
    }
    harness.assert_slot_invariant(slot.id).await;
}

#[tokio::test]
async fn test_versions_only_increase_over_lifecycle() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let mut last_version = harness.slot(slot.id).await.version();

    for _ in 0..3 {
        let appointment = harness.coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();
        let booked = harness.slot(slot.id).await.version();
        assert!(booked > last_version);

        harness.coordinator.cancel(appointment.id, Actor::System).await.unwrap();
        let freed = harness.slot(slot.id).await.version();
        assert!(freed > booked);
        last_version = freed;
    }

    assert_eq!(last_version, 6);
}

#[tokio::test]
async fn test_each_commit_records_one_event() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let patient_id = Uuid::new_v4();

    let appointment = harness.coordinator.book(patient_id, slot.id).await.unwrap();
    let _ = harness.coordinator.book(Uuid::new_v4(), slot.id).await;
    harness.coordinator.cancel(appointment.id, Actor::Patient(patient_id)).await.unwrap();

    let records = harness.store.pending_outbox(10).await.unwrap();
    let events: Vec<&str> = records.iter().map(|r| r.event.event_type()).collect();
    assert_eq!(events, vec!["AppointmentCreated", "AppointmentCancelled"]);
    assert!(records.iter().all(|r| r.event.appointment_id() == appointment.id));
}

#[tokio::test]
async fn test_withdraw_slot_refuses_live_booking() {
    let harness = TestHarness::new();
    let slot = harness.seed_slot(Uuid::new_v4(), 0).await;
    let appointment = harness.coordinator.book(Uuid::new_v4(), slot.id).await.unwrap();

    assert_matches!(
        harness.coordinator.withdraw_slot(slot.id).await,
        Err(BookingError::ValidationError(_))
    );

    harness.coordinator.cancel(appointment.id, Actor::Clinic).await.unwrap();
    let withdrawn = harness.coordinator.withdraw_slot(slot.id).await.unwrap();
    assert_eq!(withdrawn.id, slot.id);
    assert_matches!(
        harness.coordinator.get_slot(slot.id).await,
        Err(BookingError::SlotNotFound(_))
    );
}

/// Delays slot reads and reservations so the coordinator's store deadline fires.
struct StalledStore {
    inner: InMemorySlotStore,
    read_delay: Duration,
    reserve_delay: Duration,
}

impl StalledStore {
    fn new(read_delay: Duration, reserve_delay: Duration) -> Self {
        Self {
            inner: InMemorySlotStore::new(),
            read_delay,
            reserve_delay,
        }
    }
}

#[async_trait]
impl SlotStore for StalledStore {
    async fn import_slot(&self, slot: Slot) -> Result<(), BookingError> {
        self.inner.import_slot(slot).await
    }

    async fn remove_slot(&self, slot_id: Uuid) -> Result<Slot, BookingError> {
        self.inner.remove_slot(slot_id).await
    }

    async fn get_slot(&self, slot_id: Uuid) -> Result<Option<Slot>, BookingError> {
        tokio::time::sleep(self.read_delay).await;
        self.inner.get_slot(slot_id).await
    }

    async fn list_slots(&self, doctor_id: Uuid, window: &TimeWindow) -> Result<Vec<Slot>, BookingError> {
        self.inner.list_slots(doctor_id, window).await
    }

    async fn try_reserve(
        &self,
        slot_id: Uuid,
        expected_version: u64,
        claim: SlotClaim,
    ) -> Result<ReserveOutcome, BookingError> {
        tokio::time::sleep(self.reserve_delay).await;
        self.inner.try_reserve(slot_id, expected_version, claim).await
    }

    async fn get_appointment(&self, appointment_id: Uuid) -> Result<Option<Appointment>, BookingError> {
        self.inner.get_appointment(appointment_id).await
    }

    async fn appointments_for_slot(&self, slot_id: Uuid) -> Result<Vec<Appointment>, BookingError> {
        self.inner.appointments_for_slot(slot_id).await
    }

    async fn apply_transition(&self, update: AppointmentUpdate) -> Result<TransitionOutcome, BookingError> {
        self.inner.apply_transition(update).await
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>, BookingError> {
        self.inner.pending_outbox(limit).await
    }

    async fn mark_dispatched(&self, record_ids: &[Uuid]) -> Result<(), BookingError> {
        self.inner.mark_dispatched(record_ids).await
    }

    async fn record_delivery_failure(&self, record_id: Uuid, error: &str) -> Result<(), BookingError> {
        self.inner.record_delivery_failure(record_id, error).await
    }

    async fn outbox_depth(&self) -> Result<u64, BookingError> {
        self.inner.outbox_depth().await
    }

    async fn find_orphaned_reservations(&self) -> Result<Vec<Slot>, BookingError> {
        self.inner.find_orphaned_reservations().await
    }

    async fn release_orphan(&self, slot_id: Uuid, expected_version: u64) -> Result<Option<u64>, BookingError> {
        self.inner.release_orphan(slot_id, expected_version).await
    }
}

fn stalled_coordinator(store: Arc<StalledStore>, locks: Arc<InMemoryLockManager>) -> BookingCoordinator {
    let config = BookingConfig {
        lock_ttl: Duration::from_millis(200),
        ..BookingConfig::default()
    };
    let cache = Arc::new(AvailabilityCache::new(store.clone(), &config));
    BookingCoordinator::new(store, locks, cache, Arc::new(tokio::sync::Notify::new()), config)
}

async fn import_stalled_slot(store: &StalledStore) -> Slot {
    let start = super::base_time();
    let slot = Slot::new(Uuid::new_v4(), start, start + chrono::Duration::minutes(30)).unwrap();
    store.import_slot(slot.clone()).await.unwrap();
    slot
}

#[tokio::test(start_paused = true)]
async fn test_stalled_store_fails_booking_and_frees_lock() {
    let store = Arc::new(StalledStore::new(Duration::ZERO, Duration::from_secs(5)));
    let locks = Arc::new(InMemoryLockManager::new());
    let coordinator = stalled_coordinator(store.clone(), locks.clone());
    let slot = import_stalled_slot(&store).await;

    let result = coordinator.book(Uuid::new_v4(), slot.id).await;

    assert_matches!(result, Err(BookingError::StorageFailure(_)));
    // Released on the failure path rather than left to expire.
    assert_eq!(locks.purge_expired().await.unwrap(), 0);
    assert!(!store.get_slot(slot.id).await.unwrap().unwrap().is_booked());
}

#[tokio::test(start_paused = true)]
async fn test_store_deadline_runs_from_lock_acquisition() {
    // Each call fits in the 200ms TTL on its own; together they outlive the lock.
    let store = Arc::new(StalledStore::new(Duration::from_millis(120), Duration::from_millis(120)));
    let locks = Arc::new(InMemoryLockManager::new());
    let coordinator = stalled_coordinator(store.clone(), locks.clone());
    let slot = import_stalled_slot(&store).await;

    let result = coordinator.book(Uuid::new_v4(), slot.id).await;

    assert_matches!(result, Err(BookingError::StorageFailure(_)));
    assert!(!store.inner.get_slot(slot.id).await.unwrap().unwrap().is_booked());
    assert!(store.inner.appointments_for_slot(slot.id).await.unwrap().is_empty());
}
