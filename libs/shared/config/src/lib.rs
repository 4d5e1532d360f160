use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_port: u16,
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    pub booking_lock_ttl_ms: u64,
    pub availability_cache_ttl_secs: u64,
    pub availability_cache_max_entries: u64,
    pub payment_required: bool,
    pub outbox_poll_interval_ms: u64,
    pub outbox_batch_size: usize,
    pub outbox_stuck_after_attempts: u32,
    pub consistency_sweep_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_port: 3000,
            redis_url: None,
            redis_key_prefix: "slot_booking:".to_string(),
            booking_lock_ttl_ms: 5_000,
            availability_cache_ttl_secs: 30,
            availability_cache_max_entries: 10_000,
            payment_required: true,
            outbox_poll_interval_ms: 500,
            outbox_batch_size: 100,
            outbox_stuck_after_attempts: 10,
            consistency_sweep_interval_secs: 60,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            server_port: parse_or("SERVER_PORT", defaults.server_port),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            redis_key_prefix: env::var("REDIS_KEY_PREFIX")
                .unwrap_or_else(|_| defaults.redis_key_prefix.clone()),
            booking_lock_ttl_ms: parse_or("BOOKING_LOCK_TTL_MS", defaults.booking_lock_ttl_ms),
            availability_cache_ttl_secs: parse_or(
                "AVAILABILITY_CACHE_TTL_SECS",
                defaults.availability_cache_ttl_secs,
            ),
            availability_cache_max_entries: parse_or(
                "AVAILABILITY_CACHE_MAX_ENTRIES",
                defaults.availability_cache_max_entries,
            ),
            payment_required: parse_or("PAYMENT_REQUIRED", defaults.payment_required),
            outbox_poll_interval_ms: parse_or("OUTBOX_POLL_INTERVAL_MS", defaults.outbox_poll_interval_ms),
            outbox_batch_size: parse_or("OUTBOX_BATCH_SIZE", defaults.outbox_batch_size),
            outbox_stuck_after_attempts: parse_or(
                "OUTBOX_STUCK_AFTER_ATTEMPTS",
                defaults.outbox_stuck_after_attempts,
            ),
            consistency_sweep_interval_secs: parse_or(
                "CONSISTENCY_SWEEP_INTERVAL_SECS",
                defaults.consistency_sweep_interval_secs,
            ),
        };

        if !config.is_redis_configured() {
            warn!("REDIS_URL not set, running with in-memory slot store and locks");
        }

        config
    }

    pub fn is_redis_configured(&self) -> bool {
        self.redis_url.is_some()
    }
}

fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value {:?}, using default {:?}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
