use deadpool_redis::{Config, Connection, Pool, Runtime};
use tracing::info;
use uuid::Uuid;

use crate::BookingError;

/// Create a Redis pool and check it answers PING before handing it out.
pub async fn create_redis_pool(redis_url: &str) -> Result<Pool, BookingError> {
    let cfg = Config::from_url(redis_url);
    let pool = cfg.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
        BookingError::RedisError(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "Failed to create Redis pool",
            format!("Pool creation error: {}", e),
        )))
    })?;

    let mut conn = get_connection(&pool).await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!("Redis pool for slot booking initialized successfully");

    Ok(pool)
}

pub(crate) async fn get_connection(pool: &Pool) -> Result<Connection, BookingError> {
    pool.get().await.map_err(|e| {
        BookingError::RedisError(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "Failed to get Redis connection",
            e.to_string(),
        )))
    })
}

/// Key layout shared by the Redis-backed store, lock manager and publisher.
/// The prefix namespaces a deployment (or a test run).
#[derive(Debug, Clone, Default)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn slot(&self, slot_id: impl std::fmt::Display) -> String {
        format!("{}slot:{}", self.prefix, slot_id)
    }

    pub fn doctor_slots(&self, doctor_id: Uuid) -> String {
        format!("{}doctor_slots:{}", self.prefix, doctor_id)
    }

    pub fn slot_claim(&self, slot_id: Uuid) -> String {
        format!("{}slot_claim:{}", self.prefix, slot_id)
    }

    pub fn slot_appointments(&self, slot_id: Uuid) -> String {
        format!("{}slot_appointments:{}", self.prefix, slot_id)
    }

    pub fn booked_slots(&self) -> String {
        format!("{}booked_slots", self.prefix)
    }

    pub fn appointment_prefix(&self) -> String {
        format!("{}appointment:", self.prefix)
    }

    pub fn appointment(&self, appointment_id: impl std::fmt::Display) -> String {
        format!("{}{}", self.appointment_prefix(), appointment_id)
    }

    pub fn outbox_pending(&self) -> String {
        format!("{}booking_outbox:pending", self.prefix)
    }

    pub fn outbox_records(&self) -> String {
        format!("{}booking_outbox:records", self.prefix)
    }

    pub fn slot_lock(&self, slot_id: Uuid) -> String {
        format!("{}slot_lock:{}", self.prefix, slot_id)
    }

    pub fn outbound_events(&self) -> String {
        format!("{}booking_events:outbound", self.prefix)
    }
}
