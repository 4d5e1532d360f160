// libs/slot-booking-cell/src/models.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use shared_config::AppConfig;

use crate::error::BookingError;

/// Longest window a single availability listing may cover.
pub const MAX_AVAILABILITY_WINDOW_DAYS: i64 = 31;

// ==============================================================================
// SLOT MODELS
// ==============================================================================

/// A bookable time window owned by one doctor.
///
/// `is_booked` and `version` only change through the slot store's conditional
/// writes, so they are not public fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Slot {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    is_booked: bool,
    version: u64,
}

impl Slot {
    pub fn new(
        doctor_id: Uuid,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Self, BookingError> {
        Self::from_parts(Uuid::new_v4(), doctor_id, start_time, end_time, false, 0)
    }

    /// Rebuild a slot row as persisted by the schedule generator or a store backend.
    pub fn from_parts(
        id: Uuid,
        doctor_id: Uuid,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        is_booked: bool,
        version: u64,
    ) -> Result<Self, BookingError> {
        if start_time >= end_time {
            return Err(BookingError::ValidationError(format!(
                "Slot {} must start before it ends ({} >= {})",
                id, start_time, end_time
            )));
        }

        Ok(Self {
            id,
            doctor_id,
            start_time,
            end_time,
            is_booked,
            version,
        })
    }

    pub fn is_booked(&self) -> bool {
        self.is_booked
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            from: self.start_time,
            to: self.end_time,
        }
    }

    pub fn summary(&self) -> SlotSummary {
        SlotSummary {
            slot_id: self.id,
            doctor_id: self.doctor_id,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    /// Set the booking flag and bump the version. Returns the new version.
    pub(crate) fn mark_booked(&mut self) -> u64 {
        self.is_booked = true;
        self.version += 1;
        self.version
    }

    /// Clear the booking flag and bump the version. Returns the new version.
    pub(crate) fn mark_free(&mut self) -> u64 {
        self.is_booked = false;
        self.version += 1;
        self.version
    }
}

/// What availability listings return for a bookable slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlotSummary {
    pub slot_id: Uuid,
    pub doctor_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Half-open interval `[from, to)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, BookingError> {
        if from >= to {
            return Err(BookingError::ValidationError(
                "Availability window must start before it ends".to_string(),
            ));
        }

        if to - from > ChronoDuration::days(MAX_AVAILABILITY_WINDOW_DAYS) {
            return Err(BookingError::ValidationError(format!(
                "Availability window may span at most {} days",
                MAX_AVAILABILITY_WINDOW_DAYS
            )));
        }

        Ok(Self { from, to })
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.from <= instant && instant < self.to
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.from < other.to && other.from < self.to
    }
}

// ==============================================================================
// APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub slot_id: Uuid,
    pub doctor_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub cancelled_by: Option<Actor>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// A fresh claim on `slot`, not yet persisted.
    pub fn claim(patient_id: Uuid, slot: &Slot, status: AppointmentStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            slot_id: slot.id,
            doctor_id: slot.doctor_id,
            start_time: slot.start_time,
            end_time: slot.end_time,
            status,
            cancelled_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status != AppointmentStatus::Cancelled
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            from: self.start_time,
            to: self.end_time,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::Completed)
    }

    pub fn can_transition_to(&self, target: &AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, target),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Patient(Uuid),
    Clinic,
    PaymentSaga,
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Patient(id) => write!(f, "patient:{}", id),
            Actor::Clinic => write!(f, "clinic"),
            Actor::PaymentSaga => write!(f, "payment_saga"),
            Actor::System => write!(f, "system"),
        }
    }
}

// ==============================================================================
// EVENTS & OUTBOX
// ==============================================================================

/// Events handed to the notification and payment collaborators.
/// Consumers must be idempotent on `appointment_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type")]
pub enum BookingEvent {
    AppointmentCreated {
        appointment_id: Uuid,
        slot_id: Uuid,
        patient_id: Uuid,
        start_time: DateTime<Utc>,
    },
    AppointmentConfirmed {
        appointment_id: Uuid,
        slot_id: Uuid,
    },
    AppointmentCancelled {
        appointment_id: Uuid,
        slot_id: Uuid,
    },
    AppointmentCompleted {
        appointment_id: Uuid,
        slot_id: Uuid,
    },
}

impl BookingEvent {
    pub fn created(appointment: &Appointment) -> Self {
        BookingEvent::AppointmentCreated {
            appointment_id: appointment.id,
            slot_id: appointment.slot_id,
            patient_id: appointment.patient_id,
            start_time: appointment.start_time,
        }
    }

    pub fn appointment_id(&self) -> Uuid {
        match self {
            BookingEvent::AppointmentCreated { appointment_id, .. }
            | BookingEvent::AppointmentConfirmed { appointment_id, .. }
            | BookingEvent::AppointmentCancelled { appointment_id, .. }
            | BookingEvent::AppointmentCompleted { appointment_id, .. } => *appointment_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            BookingEvent::AppointmentCreated { .. } => "AppointmentCreated",
            BookingEvent::AppointmentConfirmed { .. } => "AppointmentConfirmed",
            BookingEvent::AppointmentCancelled { .. } => "AppointmentCancelled",
            BookingEvent::AppointmentCompleted { .. } => "AppointmentCompleted",
        }
    }
}

/// An event recorded in the same atomic unit as the state change it describes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub event: BookingEvent,
    pub recorded_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn new(event: BookingEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            recorded_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}

// ==============================================================================
// STORE COMMANDS & OUTCOMES
// ==============================================================================

/// Everything written alongside a successful slot reservation.
#[derive(Debug, Clone)]
pub struct SlotClaim {
    pub appointment: Appointment,
    pub outbox: OutboxRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Committed {
        new_version: u64,
        appointment: Appointment,
    },
    /// The slot was already booked or its version moved on.
    Conflict { current_version: u64, is_booked: bool },
}

/// An appointment status change, applied only if the stored status still
/// equals `expected_status`.
#[derive(Debug, Clone)]
pub struct AppointmentUpdate {
    pub appointment: Appointment,
    pub expected_status: AppointmentStatus,
    pub release_slot: bool,
    pub outbox: Option<OutboxRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied {
        appointment: Appointment,
        slot_version: Option<u64>,
    },
    StatusChanged,
}

// ==============================================================================
// CONFIGURATION
// ==============================================================================

#[derive(Debug, Clone)]
pub struct BookingConfig {
    /// Lock lifetime; also bounds every store call made by the coordinator.
    pub lock_ttl: Duration,
    pub cache_ttl: Duration,
    /// Upper bound on cached (doctor, window) listings.
    pub cache_max_entries: u64,
    /// When false, bookings are created directly as `Confirmed`.
    pub payment_required: bool,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_stuck_after_attempts: u32,
    pub sweep_interval: Duration,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_millis(5_000),
            cache_ttl: Duration::from_secs(30),
            cache_max_entries: 10_000,
            payment_required: true,
            outbox_poll_interval: Duration::from_millis(500),
            outbox_batch_size: 100,
            outbox_stuck_after_attempts: 10,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl From<&AppConfig> for BookingConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            lock_ttl: Duration::from_millis(config.booking_lock_ttl_ms),
            cache_ttl: Duration::from_secs(config.availability_cache_ttl_secs),
            cache_max_entries: config.availability_cache_max_entries,
            payment_required: config.payment_required,
            outbox_poll_interval: Duration::from_millis(config.outbox_poll_interval_ms),
            outbox_batch_size: config.outbox_batch_size,
            outbox_stuck_after_attempts: config.outbox_stuck_after_attempts,
            sweep_interval: Duration::from_secs(config.consistency_sweep_interval_secs),
        }
    }
}

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSlotRequest {
    pub doctor_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSlotRequest {
    pub patient_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelAppointmentRequest {
    pub actor: Actor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

// ==============================================================================
// HEALTH MODELS
// ==============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub discarded_populates: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum BookingHealth {
    Healthy,
    Degraded(String),
    Critical(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingHealth {
    pub status: BookingHealth,
    pub outbox_depth: u64,
    pub stuck_outbox_records: usize,
    pub orphaned_reservations: usize,
    pub cache: CacheStats,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SweepReport {
    pub orphans_found: usize,
    pub orphans_released: usize,
    pub expired_locks_purged: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}
