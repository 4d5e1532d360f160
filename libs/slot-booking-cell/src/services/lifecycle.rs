// libs/slot-booking-cell/src/services/lifecycle.rs
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{Actor, Appointment, AppointmentStatus, BookingError, BookingEvent};

/// Requested change to an appointment's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentTransition {
    Confirm,
    Complete,
    Cancel { actor: Actor },
}

impl AppointmentTransition {
    pub fn target(&self) -> AppointmentStatus {
        match self {
            AppointmentTransition::Confirm => AppointmentStatus::Confirmed,
            AppointmentTransition::Complete => AppointmentStatus::Completed,
            AppointmentTransition::Cancel { .. } => AppointmentStatus::Cancelled,
        }
    }
}

/// The writes a legal transition requires, computed before touching the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    pub expected_status: AppointmentStatus,
    pub updated: Appointment,
    pub releases_slot: bool,
    pub event: BookingEvent,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AppointmentLifecycleService;

impl AppointmentLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// Status a new appointment is created with.
    pub fn initial_status(&self, payment_required: bool) -> AppointmentStatus {
        if payment_required {
            AppointmentStatus::Pending
        } else {
            AppointmentStatus::Confirmed
        }
    }

    pub fn validate_status_transition(
        &self,
        current_status: &AppointmentStatus,
        new_status: &AppointmentStatus,
    ) -> Result<(), BookingError> {
        debug!("Validating status transition from {} to {}", current_status, new_status);

        if !current_status.can_transition_to(new_status) {
            warn!("Invalid status transition attempted: {} -> {}", current_status, new_status);
            return Err(BookingError::InvalidState {
                from: *current_status,
                to: *new_status,
            });
        }

        Ok(())
    }

    /// Validate `transition` against `appointment` and build the resulting state.
    pub fn plan(
        &self,
        appointment: &Appointment,
        transition: AppointmentTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionPlan, BookingError> {
        let target = transition.target();
        self.validate_status_transition(&appointment.status, &target)?;

        let mut updated = appointment.clone();
        updated.status = target;
        updated.updated_at = now;
        if let AppointmentTransition::Cancel { actor } = transition {
            updated.cancelled_by = Some(actor);
        }

        let event = match target {
            AppointmentStatus::Confirmed => BookingEvent::AppointmentConfirmed {
                appointment_id: appointment.id,
                slot_id: appointment.slot_id,
            },
            AppointmentStatus::Completed => BookingEvent::AppointmentCompleted {
                appointment_id: appointment.id,
                slot_id: appointment.slot_id,
            },
            AppointmentStatus::Cancelled => BookingEvent::AppointmentCancelled {
                appointment_id: appointment.id,
                slot_id: appointment.slot_id,
            },
            // can_transition_to never targets Pending
            AppointmentStatus::Pending => {
                return Err(BookingError::InvalidState {
                    from: appointment.status,
                    to: target,
                })
            }
        };

        Ok(TransitionPlan {
            expected_status: appointment.status,
            updated,
            releases_slot: target == AppointmentStatus::Cancelled,
            event,
        })
    }
}
