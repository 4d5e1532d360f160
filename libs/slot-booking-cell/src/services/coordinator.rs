// libs/slot-booking-cell/src/services/coordinator.rs
//
// The only entry point allowed to change a slot's booking state.
//
// Booking takes the slot lock, re-reads the slot and issues the store's
// conditional write. A commit is durable before the cache is invalidated or
// the dispatcher is woken, so a crash in between leaves a stale cache entry
// or a late notification, never a double booking.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::services::cache::AvailabilityCache;
use crate::services::lifecycle::{AppointmentLifecycleService, AppointmentTransition};
use crate::services::lock::{LockAcquisition, LockRelease, LockToken, SlotLockManager};
use crate::services::slot_store::SlotStore;
use crate::{
    Actor, Appointment, AppointmentStatus, AppointmentUpdate, BookingConfig, BookingError,
    BookingEvent, OutboxRecord, ReserveOutcome, Slot, SlotClaim, SlotSummary, TimeWindow,
    TransitionOutcome,
};

/// Re-plans when a concurrent writer changed the status under us.
const MAX_TRANSITION_ATTEMPTS: u32 = 3;

pub struct BookingCoordinator {
    store: Arc<dyn SlotStore>,
    locks: Arc<dyn SlotLockManager>,
    cache: Arc<AvailabilityCache>,
    lifecycle: AppointmentLifecycleService,
    outbox_wakeup: Arc<Notify>,
    config: BookingConfig,
}

impl BookingCoordinator {
    pub fn new(
        store: Arc<dyn SlotStore>,
        locks: Arc<dyn SlotLockManager>,
        cache: Arc<AvailabilityCache>,
        outbox_wakeup: Arc<Notify>,
        config: BookingConfig,
    ) -> Self {
        Self {
            store,
            locks,
            cache,
            lifecycle: AppointmentLifecycleService::new(),
            outbox_wakeup,
            config,
        }
    }

    pub fn config(&self) -> &BookingConfig {
        &self.config
    }

    // ==========================================================================
    // BOOKING
    // ==========================================================================

    /// Claim `slot_id` for `patient_id`.
    ///
    /// Fails fast: an already-booked slot is `SlotUnavailable` without touching
    /// the lock, and a held lock is `SlotBusy`. A lost conditional write is
    /// `SlotUnavailable` and is never retried here.
    #[instrument(skip(self), fields(slot_id = %slot_id, patient_id = %patient_id))]
    pub async fn book(&self, patient_id: Uuid, slot_id: Uuid) -> Result<Appointment, BookingError> {
        let slot = self.load_slot(slot_id).await?;
        if slot.is_booked() {
            debug!("Slot {} already booked, skipping lock", slot_id);
            return Err(BookingError::SlotUnavailable { slot_id });
        }

        // Everything done under the lock must finish before it can expire.
        let deadline = Instant::now() + self.config.lock_ttl;
        let token = match self.locks.acquire(slot_id, self.config.lock_ttl).await? {
            LockAcquisition::Acquired(token) => token,
            LockAcquisition::Busy => {
                info!("Slot {} is locked by another booking", slot_id);
                return Err(BookingError::SlotBusy { slot_id });
            }
        };

        let appointment = match self.reserve_under_lock(patient_id, slot_id, deadline).await {
            Ok(appointment) => appointment,
            Err(e) => {
                self.release_lock(slot_id, &token).await;
                return Err(e);
            }
        };

        self.cache.invalidate(appointment.doctor_id, appointment.window()).await;
        self.release_lock(slot_id, &token).await;
        self.outbox_wakeup.notify_one();

        info!(
            "Booked slot {} for patient {} as appointment {} ({})",
            slot_id, patient_id, appointment.id, appointment.status
        );
        Ok(appointment)
    }

    async fn reserve_under_lock(
        &self,
        patient_id: Uuid,
        slot_id: Uuid,
        deadline: Instant,
    ) -> Result<Appointment, BookingError> {
        // The version may have moved between the first read and the lock.
        let slot = self
            .bounded_until(deadline, "read slot", self.store.get_slot(slot_id))
            .await?
            .ok_or(BookingError::SlotNotFound(slot_id))?;

        let status = self.lifecycle.initial_status(self.config.payment_required);
        let appointment = Appointment::claim(patient_id, &slot, status, Utc::now());
        let claim = SlotClaim {
            outbox: OutboxRecord::new(BookingEvent::created(&appointment)),
            appointment,
        };

        let outcome = self
            .bounded_until(deadline, "reserve slot", self.store.try_reserve(slot_id, slot.version(), claim))
            .await?;

        match outcome {
            ReserveOutcome::Committed {
                new_version,
                appointment,
            } => {
                debug!("Slot {} committed at version {}", slot_id, new_version);
                Ok(appointment)
            }
            ReserveOutcome::Conflict {
                current_version,
                is_booked,
            } => {
                info!(
                    "Lost reservation race for slot {} (expected version {}, found {}, booked {})",
                    slot_id,
                    slot.version(),
                    current_version,
                    is_booked
                );
                Err(BookingError::SlotUnavailable { slot_id })
            }
        }
    }

    async fn release_lock(&self, slot_id: Uuid, token: &LockToken) {
        match self.locks.release(slot_id, token).await {
            Ok(LockRelease::Released) => {}
            Ok(LockRelease::AlreadyExpired) => {
                warn!("Slot lock {} expired before release", slot_id);
            }
            Err(e) => {
                // The TTL frees it eventually.
                error!("Failed to release slot lock {}: {}", slot_id, e);
            }
        }
    }

    // ==========================================================================
    // LIFECYCLE
    // ==========================================================================

    /// Cancel a pending or confirmed appointment and free its slot.
    #[instrument(skip(self), fields(appointment_id = %appointment_id, actor = %actor))]
    pub async fn cancel(&self, appointment_id: Uuid, actor: Actor) -> Result<Appointment, BookingError> {
        self.transition(appointment_id, AppointmentTransition::Cancel { actor }, |appointment| {
            match actor {
                Actor::Patient(patient_id) if patient_id != appointment.patient_id => {
                    Err(BookingError::Forbidden {
                        appointment_id,
                        actor: actor.to_string(),
                    })
                }
                _ => Ok(()),
            }
        })
        .await
    }

    /// Payment finalization: `Pending → Confirmed`.
    #[instrument(skip(self), fields(appointment_id = %appointment_id))]
    pub async fn confirm(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        self.transition(appointment_id, AppointmentTransition::Confirm, reject_terminal)
            .await
    }

    /// Payment compensation: cancels an appointment still awaiting payment.
    #[instrument(skip(self), fields(appointment_id = %appointment_id))]
    pub async fn cancel_pending(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        self.transition(
            appointment_id,
            AppointmentTransition::Cancel {
                actor: Actor::PaymentSaga,
            },
            |appointment| {
                reject_terminal(appointment)?;
                if appointment.status != AppointmentStatus::Pending {
                    return Err(BookingError::InvalidState {
                        from: appointment.status,
                        to: AppointmentStatus::Cancelled,
                    });
                }
                Ok(())
            },
        )
        .await
    }

    /// Archival transition after the visit: `Confirmed → Completed`.
    #[instrument(skip(self), fields(appointment_id = %appointment_id))]
    pub async fn complete(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        self.transition(appointment_id, AppointmentTransition::Complete, |_| Ok(()))
            .await
    }

    async fn transition<F>(
        &self,
        appointment_id: Uuid,
        transition: AppointmentTransition,
        precheck: F,
    ) -> Result<Appointment, BookingError>
    where
        F: Fn(&Appointment) -> Result<(), BookingError>,
    {
        for attempt in 1..=MAX_TRANSITION_ATTEMPTS {
            let current = self.load_appointment(appointment_id).await?;
            precheck(&current)?;

            let plan = self.lifecycle.plan(&current, transition, Utc::now())?;
            let update = AppointmentUpdate {
                appointment: plan.updated,
                expected_status: plan.expected_status,
                release_slot: plan.releases_slot,
                outbox: Some(OutboxRecord::new(plan.event)),
            };

            match self
                .bounded("apply appointment transition", self.store.apply_transition(update))
                .await?
            {
                TransitionOutcome::Applied {
                    appointment,
                    slot_version,
                } => {
                    if let Some(version) = slot_version {
                        debug!("Slot {} released at version {}", appointment.slot_id, version);
                        self.cache.invalidate(appointment.doctor_id, appointment.window()).await;
                    }
                    self.outbox_wakeup.notify_one();

                    info!(
                        "Appointment {} moved from {} to {}",
                        appointment.id, current.status, appointment.status
                    );
                    return Ok(appointment);
                }
                TransitionOutcome::StatusChanged => {
                    warn!(
                        "Appointment {} changed concurrently (attempt {}/{})",
                        appointment_id, attempt, MAX_TRANSITION_ATTEMPTS
                    );
                }
            }
        }

        Err(BookingError::StorageFailure(format!(
            "Appointment {} kept changing during {:?}",
            appointment_id, transition
        )))
    }

    // ==========================================================================
    // SCHEDULE
    // ==========================================================================

    /// Make a generated slot bookable.
    #[instrument(skip(self, slot), fields(slot_id = %slot.id, doctor_id = %slot.doctor_id))]
    pub async fn publish_slot(&self, slot: Slot) -> Result<Slot, BookingError> {
        self.bounded("import slot", self.store.import_slot(slot.clone())).await?;
        self.cache.invalidate(slot.doctor_id, slot.window()).await;

        info!("Published slot {} ({} - {})", slot.id, slot.start_time, slot.end_time);
        Ok(slot)
    }

    /// Withdraw a slot nobody holds a live appointment on.
    #[instrument(skip(self), fields(slot_id = %slot_id))]
    pub async fn withdraw_slot(&self, slot_id: Uuid) -> Result<Slot, BookingError> {
        let slot = self.bounded("remove slot", self.store.remove_slot(slot_id)).await?;
        self.cache.invalidate(slot.doctor_id, slot.window()).await;

        info!("Withdrew slot {}", slot_id);
        Ok(slot)
    }

    // ==========================================================================
    // READS
    // ==========================================================================

    pub async fn get_slot(&self, slot_id: Uuid) -> Result<Slot, BookingError> {
        self.load_slot(slot_id).await
    }

    pub async fn get_appointment(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        self.load_appointment(appointment_id).await
    }

    /// Bookable slots from the availability cache; may lag a commit by at most the cache TTL
    /// unless the coordinator has already invalidated the doctor's window.
    pub async fn list_availability(
        &self,
        doctor_id: Uuid,
        window: TimeWindow,
    ) -> Result<Vec<SlotSummary>, BookingError> {
        self.cache.list(doctor_id, window).await
    }

    async fn load_slot(&self, slot_id: Uuid) -> Result<Slot, BookingError> {
        self.bounded("read slot", self.store.get_slot(slot_id))
            .await?
            .ok_or(BookingError::SlotNotFound(slot_id))
    }

    async fn load_appointment(&self, appointment_id: Uuid) -> Result<Appointment, BookingError> {
        self.bounded("read appointment", self.store.get_appointment(appointment_id))
            .await?
            .ok_or(BookingError::AppointmentNotFound(appointment_id))
    }

    /// A single store call may not outlive the lock TTL.
    async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, BookingError>
    where
        F: Future<Output = Result<T, BookingError>>,
    {
        self.bounded_until(Instant::now() + self.config.lock_ttl, operation, call)
            .await
    }

    /// Fail the call once `deadline` passes. A timed-out write is reported as a
    /// failure even though it may still land; the version check keeps that safe.
    async fn bounded_until<T, F>(&self, deadline: Instant, operation: &str, call: F) -> Result<T, BookingError>
    where
        F: Future<Output = Result<T, BookingError>>,
    {
        match timeout_at(deadline, call).await {
            Ok(result) => result.map_err(|e| match e {
                BookingError::RedisError(inner) => BookingError::StorageFailure(inner.to_string()),
                other => other,
            }),
            Err(_) => {
                error!("Slot store did not {} within {:?}", operation, self.config.lock_ttl);
                Err(BookingError::StorageFailure(format!(
                    "Slot store did not {} within {:?}",
                    operation, self.config.lock_ttl
                )))
            }
        }
    }
}

fn reject_terminal(appointment: &Appointment) -> Result<(), BookingError> {
    if appointment.status.is_terminal() {
        return Err(BookingError::AlreadyTerminal {
            status: appointment.status,
        });
    }
    Ok(())
}
