use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{
    book_slot, booking_health, cancel_appointment, cancel_pending_appointment, complete_appointment,
    confirm_appointment, get_appointment, get_doctor_availability, get_slot, publish_slot, withdraw_slot,
};
use crate::services::{BookingCoordinator, ConsistencyService};

pub struct BookingState {
    pub coordinator: Arc<BookingCoordinator>,
    pub consistency: Arc<ConsistencyService>,
}

pub fn slot_booking_routes(state: Arc<BookingState>) -> Router {
    // Called by the schedule generator and the payment and clinic services,
    // not by patients.
    let internal_routes = Router::new()
        .route("/slots", post(publish_slot))
        .route("/appointments/{appointment_id}/confirm", post(confirm_appointment))
        .route("/appointments/{appointment_id}/cancel-pending", post(cancel_pending_appointment))
        .route("/appointments/{appointment_id}/complete", post(complete_appointment));

    Router::new()
        .route("/slots/{slot_id}", get(get_slot).delete(withdraw_slot))
        .route("/slots/{slot_id}/book", post(book_slot))
        .route("/doctors/{doctor_id}/availability", get(get_doctor_availability))
        .route("/appointments/{appointment_id}", get(get_appointment))
        .route("/appointments/{appointment_id}/cancel", post(cancel_appointment))
        .route("/health", get(booking_health))
        .merge(internal_routes)
        .with_state(state)
}
