use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use shared_models::AppError;

use crate::router::BookingState;
use crate::{
    AvailabilityQuery, BookSlotRequest, BookingHealth, CancelAppointmentRequest, PublishSlotRequest, Slot,
    TimeWindow,
};

/// Book a slot for a patient
pub async fn book_slot(
    State(state): State<Arc<BookingState>>,
    Path(slot_id): Path<Uuid>,
    Json(request): Json<BookSlotRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    info!("Booking request for slot {} from patient {}", slot_id, request.patient_id);

    let appointment = state.coordinator.book(request.patient_id, slot_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "appointment": appointment
        })),
    ))
}

/// Publish a slot produced by the schedule generator
pub async fn publish_slot(
    State(state): State<Arc<BookingState>>,
    Json(request): Json<PublishSlotRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let slot = Slot::new(request.doctor_id, request.start_time, request.end_time)?;
    let slot = state.coordinator.publish_slot(slot).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "slot": slot
        })),
    ))
}

pub async fn withdraw_slot(
    State(state): State<Arc<BookingState>>,
    Path(slot_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let slot = state.coordinator.withdraw_slot(slot_id).await?;

    Ok(Json(json!({
        "success": true,
        "slot": slot,
        "message": "Slot withdrawn"
    })))
}

pub async fn get_slot(
    State(state): State<Arc<BookingState>>,
    Path(slot_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let slot = state.coordinator.get_slot(slot_id).await?;

    Ok(Json(json!({
        "success": true,
        "slot": slot
    })))
}

/// List bookable slots for a doctor. Served from the availability cache.
pub async fn get_doctor_availability(
    State(state): State<Arc<BookingState>>,
    Path(doctor_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<Value>, AppError> {
    let window = TimeWindow::new(query.from, query.to)?;
    let slots = state.coordinator.list_availability(doctor_id, window).await?;

    Ok(Json(json!({
        "success": true,
        "doctor_id": doctor_id,
        "from": window.from,
        "to": window.to,
        "total": slots.len(),
        "slots": slots
    })))
}

pub async fn get_appointment(
    State(state): State<Arc<BookingState>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.coordinator.get_appointment(appointment_id).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

pub async fn cancel_appointment(
    State(state): State<Arc<BookingState>>,
    Path(appointment_id): Path<Uuid>,
    Json(request): Json<CancelAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    info!("Cancel request for appointment {} by {}", appointment_id, request.actor);

    let appointment = state.coordinator.cancel(appointment_id, request.actor).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment cancelled"
    })))
}

/// Payment succeeded
pub async fn confirm_appointment(
    State(state): State<Arc<BookingState>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.coordinator.confirm(appointment_id).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

/// Payment failed or timed out
pub async fn cancel_pending_appointment(
    State(state): State<Arc<BookingState>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.coordinator.cancel_pending(appointment_id).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Pending appointment released"
    })))
}

pub async fn complete_appointment(
    State(state): State<Arc<BookingState>>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.coordinator.complete(appointment_id).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment
    })))
}

pub async fn booking_health(State(state): State<Arc<BookingState>>) -> Result<(StatusCode, Json<Value>), AppError> {
    let health = state.consistency.health().await?;
    let status = match health.status {
        BookingHealth::Critical(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    Ok((
        status,
        Json(json!({
            "success": status == StatusCode::OK,
            "health": health
        })),
    ))
}
