use shared_models::AppError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::AppointmentStatus;

#[derive(Error, Debug)]
pub enum BookingError {
    #[error("Slot not found: {0}")]
    SlotNotFound(Uuid),

    #[error("Appointment not found: {0}")]
    AppointmentNotFound(Uuid),

    #[error("Slot {slot_id} is no longer available")]
    SlotUnavailable { slot_id: Uuid },

    #[error("Slot {slot_id} is being booked by another request")]
    SlotBusy { slot_id: Uuid },

    #[error("Invalid appointment status transition from {from} to {to}")]
    InvalidState {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },

    #[error("Appointment is already {status}")]
    AlreadyTerminal { status: AppointmentStatus },

    #[error("{actor} may not modify appointment {appointment_id}")]
    Forbidden { appointment_id: Uuid, actor: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Redis connection error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Event delivery failed: {0}")]
    EventDelivery(String),
}

impl BookingError {
    /// Whether the caller should simply try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BookingError::SlotBusy { .. }
                | BookingError::StorageFailure(_)
                | BookingError::RedisError(_)
                | BookingError::EventDelivery(_)
        )
    }
}

impl From<BookingError> for AppError {
    fn from(e: BookingError) -> Self {
        let message = e.to_string();
        match e {
            BookingError::SlotNotFound(_) | BookingError::AppointmentNotFound(_) => AppError::NotFound(message),
            BookingError::SlotUnavailable { .. }
            | BookingError::InvalidState { .. }
            | BookingError::AlreadyTerminal { .. } => AppError::Conflict(message),
            BookingError::SlotBusy { .. } => AppError::Busy(message),
            BookingError::Forbidden { .. } => AppError::Forbidden(message),
            BookingError::ValidationError(_) => AppError::ValidationError(message),
            BookingError::StorageFailure(_) | BookingError::RedisError(_) => AppError::ServiceUnavailable(message),
            BookingError::SerializationError(_) | BookingError::EventDelivery(_) => AppError::Internal(message),
        }
    }
}
