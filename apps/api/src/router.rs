use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use slot_booking_cell::{slot_booking_routes, BookingState};

pub fn create_router(state: Arc<BookingState>) -> Router {
    Router::new()
        .route("/", get(|| async { "Slot Booking API is running!" }))
        .merge(slot_booking_routes(state))
}
