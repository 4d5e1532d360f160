// libs/slot-booking-cell/src/services/slot_store.rs
//
// System of record for slots, appointments and the booking outbox. Every
// write that changes a slot's booking flag also writes the matching
// appointment and outbox record in the same atomic unit.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    Appointment, AppointmentUpdate, BookingError, OutboxRecord, ReserveOutcome, Slot, SlotClaim,
    TimeWindow, TransitionOutcome,
};

#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Ingress for the external schedule generator.
    async fn import_slot(&self, slot: Slot) -> Result<(), BookingError>;

    /// Refused while a pending or confirmed appointment references the slot.
    async fn remove_slot(&self, slot_id: Uuid) -> Result<Slot, BookingError>;

    async fn get_slot(&self, slot_id: Uuid) -> Result<Option<Slot>, BookingError>;

    /// Slots of `doctor_id` starting inside `window`, ordered by start time.
    async fn list_slots(&self, doctor_id: Uuid, window: &TimeWindow) -> Result<Vec<Slot>, BookingError>;

    /// Atomic conditional write: succeeds only if the slot is unbooked and its
    /// version equals `expected_version`. On success the flag is set, the
    /// version bumped, and the claim's appointment and outbox record stored.
    async fn try_reserve(
        &self,
        slot_id: Uuid,
        expected_version: u64,
        claim: SlotClaim,
    ) -> Result<ReserveOutcome, BookingError>;

    async fn get_appointment(&self, appointment_id: Uuid) -> Result<Option<Appointment>, BookingError>;

    /// Every appointment ever created against `slot_id`, cancelled ones included.
    async fn appointments_for_slot(&self, slot_id: Uuid) -> Result<Vec<Appointment>, BookingError>;

    /// Appointment status CAS, with the compensating slot release when
    /// `release_slot` is set, in one atomic unit.
    async fn apply_transition(&self, update: AppointmentUpdate) -> Result<TransitionOutcome, BookingError>;

    /// Oldest undelivered outbox records first.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>, BookingError>;

    async fn mark_dispatched(&self, record_ids: &[Uuid]) -> Result<(), BookingError>;

    async fn record_delivery_failure(&self, record_id: Uuid, error: &str) -> Result<(), BookingError>;

    async fn outbox_depth(&self) -> Result<u64, BookingError>;

    /// Booked slots with no live appointment claiming them.
    async fn find_orphaned_reservations(&self) -> Result<Vec<Slot>, BookingError>;

    /// Clear the flag of an orphaned slot if it is still booked at
    /// `expected_version`. Returns the new version when released.
    async fn release_orphan(&self, slot_id: Uuid, expected_version: u64) -> Result<Option<u64>, BookingError>;
}

// ==============================================================================
// IN-MEMORY STORE
// ==============================================================================

#[derive(Default)]
struct MemoryTables {
    slots: HashMap<Uuid, Slot>,
    appointments: HashMap<Uuid, Appointment>,
    /// slot id -> appointment id of the most recent claim
    claims: HashMap<Uuid, Uuid>,
    slot_appointments: HashMap<Uuid, HashSet<Uuid>>,
    outbox: Vec<OutboxRecord>,
}

impl MemoryTables {
    fn live_claim(&self, slot_id: &Uuid) -> Option<&Appointment> {
        self.claims
            .get(slot_id)
            .and_then(|id| self.appointments.get(id))
            .filter(|appointment| appointment.is_live())
    }
}

/// Single-process store. One lock spans every table, so each write is a
/// transaction.
#[derive(Default)]
pub struct InMemorySlotStore {
    tables: RwLock<MemoryTables>,
}

impl InMemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStore for InMemorySlotStore {
    async fn import_slot(&self, slot: Slot) -> Result<(), BookingError> {
        let mut tables = self.tables.write().await;

        if tables.slots.contains_key(&slot.id) {
            return Err(BookingError::ValidationError(format!("Slot {} already exists", slot.id)));
        }

        debug!("Imported slot {} for doctor {}", slot.id, slot.doctor_id);
        tables.slots.insert(slot.id, slot);
        Ok(())
    }

    async fn remove_slot(&self, slot_id: Uuid) -> Result<Slot, BookingError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        if !tables.slots.contains_key(&slot_id) {
            return Err(BookingError::SlotNotFound(slot_id));
        }

        if let Some(appointment) = tables.live_claim(&slot_id) {
            if !appointment.status.is_terminal() {
                return Err(BookingError::ValidationError(format!(
                    "Slot {} is referenced by {} appointment {}",
                    slot_id, appointment.status, appointment.id
                )));
            }
        }

        tables.claims.remove(&slot_id);
        tables
            .slots
            .remove(&slot_id)
            .ok_or(BookingError::SlotNotFound(slot_id))
    }

    async fn get_slot(&self, slot_id: Uuid) -> Result<Option<Slot>, BookingError> {
        let tables = self.tables.read().await;
        Ok(tables.slots.get(&slot_id).cloned())
    }

    async fn list_slots(&self, doctor_id: Uuid, window: &TimeWindow) -> Result<Vec<Slot>, BookingError> {
        let tables = self.tables.read().await;

        let mut slots: Vec<Slot> = tables
            .slots
            .values()
            .filter(|slot| slot.doctor_id == doctor_id && window.contains(slot.start_time))
            .cloned()
            .collect();
        slots.sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.id.cmp(&b.id)));

        Ok(slots)
    }

    async fn try_reserve(
        &self,
        slot_id: Uuid,
        expected_version: u64,
        claim: SlotClaim,
    ) -> Result<ReserveOutcome, BookingError> {
        if claim.appointment.slot_id != slot_id {
            return Err(BookingError::ValidationError(format!(
                "Appointment {} does not reference slot {}",
                claim.appointment.id, slot_id
            )));
        }

        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        let slot = tables
            .slots
            .get_mut(&slot_id)
            .ok_or(BookingError::SlotNotFound(slot_id))?;

        if slot.is_booked() || slot.version() != expected_version {
            return Ok(ReserveOutcome::Conflict {
                current_version: slot.version(),
                is_booked: slot.is_booked(),
            });
        }

        let new_version = slot.mark_booked();
        let appointment = claim.appointment;

        tables.claims.insert(slot_id, appointment.id);
        tables
            .slot_appointments
            .entry(slot_id)
            .or_default()
            .insert(appointment.id);
        tables.appointments.insert(appointment.id, appointment.clone());
        tables.outbox.push(claim.outbox);

        Ok(ReserveOutcome::Committed {
            new_version,
            appointment,
        })
    }

    async fn get_appointment(&self, appointment_id: Uuid) -> Result<Option<Appointment>, BookingError> {
        let tables = self.tables.read().await;
        Ok(tables.appointments.get(&appointment_id).cloned())
    }

    async fn appointments_for_slot(&self, slot_id: Uuid) -> Result<Vec<Appointment>, BookingError> {
        let tables = self.tables.read().await;

        let mut appointments: Vec<Appointment> = tables
            .slot_appointments
            .get(&slot_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.appointments.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        appointments.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        Ok(appointments)
    }

    async fn apply_transition(&self, update: AppointmentUpdate) -> Result<TransitionOutcome, BookingError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let appointment_id = update.appointment.id;

        let current = tables
            .appointments
            .get(&appointment_id)
            .ok_or(BookingError::AppointmentNotFound(appointment_id))?;

        if current.status != update.expected_status {
            return Ok(TransitionOutcome::StatusChanged);
        }

        let mut slot_version = None;
        if update.release_slot {
            let slot_id = current.slot_id;

            if tables.claims.get(&slot_id) != Some(&appointment_id) {
                return Err(BookingError::StorageFailure(format!(
                    "Slot {} is not claimed by appointment {}",
                    slot_id, appointment_id
                )));
            }

            let slot = tables
                .slots
                .get_mut(&slot_id)
                .ok_or(BookingError::SlotNotFound(slot_id))?;
            slot_version = Some(slot.mark_free());
            tables.claims.remove(&slot_id);
        }

        tables
            .appointments
            .insert(appointment_id, update.appointment.clone());
        if let Some(record) = update.outbox {
            tables.outbox.push(record);
        }

        Ok(TransitionOutcome::Applied {
            appointment: update.appointment,
            slot_version,
        })
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>, BookingError> {
        let tables = self.tables.read().await;
        Ok(tables.outbox.iter().take(limit).cloned().collect())
    }

    async fn mark_dispatched(&self, record_ids: &[Uuid]) -> Result<(), BookingError> {
        let mut tables = self.tables.write().await;
        tables.outbox.retain(|record| !record_ids.contains(&record.id));
        Ok(())
    }

    async fn record_delivery_failure(&self, record_id: Uuid, error: &str) -> Result<(), BookingError> {
        let mut tables = self.tables.write().await;

        match tables.outbox.iter_mut().find(|record| record.id == record_id) {
            Some(record) => {
                record.attempts += 1;
                record.last_error = Some(error.to_string());
            }
            None => warn!("Outbox record {} vanished before failure was recorded", record_id),
        }

        Ok(())
    }

    async fn outbox_depth(&self) -> Result<u64, BookingError> {
        let tables = self.tables.read().await;
        Ok(tables.outbox.len() as u64)
    }

    async fn find_orphaned_reservations(&self) -> Result<Vec<Slot>, BookingError> {
        let tables = self.tables.read().await;

        Ok(tables
            .slots
            .values()
            .filter(|slot| slot.is_booked() && tables.live_claim(&slot.id).is_none())
            .cloned()
            .collect())
    }

    async fn release_orphan(&self, slot_id: Uuid, expected_version: u64) -> Result<Option<u64>, BookingError> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        let slot = tables
            .slots
            .get_mut(&slot_id)
            .ok_or(BookingError::SlotNotFound(slot_id))?;

        if !slot.is_booked() || slot.version() != expected_version {
            return Ok(None);
        }

        let new_version = slot.mark_free();
        tables.claims.remove(&slot_id);
        Ok(Some(new_version))
    }
}
