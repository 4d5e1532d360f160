// libs/slot-booking-cell/src/services/lock.rs
//
// TTL-bounded, non-blocking mutual exclusion keyed by slot id. The lock only
// saves wasted store round trips under contention; the slot store's
// conditional write is what keeps bookings single.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use deadpool_redis::Pool;
use redis::Script;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::services::redis_pool::{get_connection, RedisKeys};
use crate::BookingError;

/// Random holder token; must be presented to release the lock.
#[derive(Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens stay out of logs.
impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockToken(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired(LockToken),
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRelease {
    Released,
    /// The lock had expired, possibly re-acquired by someone else; nothing was removed.
    AlreadyExpired,
}

#[async_trait]
pub trait SlotLockManager: Send + Sync {
    /// Never waits: a live holder yields `Busy` immediately.
    async fn acquire(&self, slot_id: Uuid, ttl: Duration) -> Result<LockAcquisition, BookingError>;

    async fn release(&self, slot_id: Uuid, token: &LockToken) -> Result<LockRelease, BookingError>;

    /// Drop handles whose TTL has passed. Returns how many were removed.
    /// Backends that expire keys on their own have nothing to do.
    async fn purge_expired(&self) -> Result<usize, BookingError> {
        Ok(0)
    }
}

// ==============================================================================
// IN-PROCESS LOCKS
// ==============================================================================

struct LockHandle {
    token: LockToken,
    expires_at: Instant,
}

/// Locks for a single process; shares nothing across instances.
#[derive(Default)]
pub struct InMemoryLockManager {
    handles: Mutex<HashMap<Uuid, LockHandle>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotLockManager for InMemoryLockManager {
    async fn acquire(&self, slot_id: Uuid, ttl: Duration) -> Result<LockAcquisition, BookingError> {
        let now = Instant::now();
        let mut handles = self.handles.lock().await;

        if let Some(existing) = handles.get(&slot_id) {
            if existing.expires_at > now {
                debug!("Slot lock {} is held, refusing acquisition", slot_id);
                return Ok(LockAcquisition::Busy);
            }
        }

        let token = LockToken::generate();
        handles.insert(
            slot_id,
            LockHandle {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );

        debug!("Slot lock acquired: {}", slot_id);
        Ok(LockAcquisition::Acquired(token))
    }

    async fn release(&self, slot_id: Uuid, token: &LockToken) -> Result<LockRelease, BookingError> {
        let now = Instant::now();
        let mut handles = self.handles.lock().await;

        match handles.get(&slot_id) {
            Some(handle) if handle.token == *token => {
                let live = handle.expires_at > now;
                handles.remove(&slot_id);
                if live {
                    debug!("Slot lock released: {}", slot_id);
                    Ok(LockRelease::Released)
                } else {
                    Ok(LockRelease::AlreadyExpired)
                }
            }
            _ => Ok(LockRelease::AlreadyExpired),
        }
    }

    async fn purge_expired(&self) -> Result<usize, BookingError> {
        let now = Instant::now();
        let mut handles = self.handles.lock().await;
        let before = handles.len();
        handles.retain(|_, h| h.expires_at > now);
        Ok(before - handles.len())
    }
}

// ==============================================================================
// NO-OP LOCKS
// ==============================================================================

/// Grants every request. Bookings stay single because the store's
/// conditional write does not depend on the lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockManager;

#[async_trait]
impl SlotLockManager for NoopLockManager {
    async fn acquire(&self, _slot_id: Uuid, _ttl: Duration) -> Result<LockAcquisition, BookingError> {
        Ok(LockAcquisition::Acquired(LockToken::generate()))
    }

    async fn release(&self, _slot_id: Uuid, _token: &LockToken) -> Result<LockRelease, BookingError> {
        Ok(LockRelease::Released)
    }
}

// ==============================================================================
// REDIS LOCKS
// ==============================================================================

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Locks shared by every instance pointed at the same Redis.
pub struct RedisLockManager {
    pool: Pool,
    keys: RedisKeys,
    release_script: Script,
}

impl RedisLockManager {
    pub fn new(pool: Pool, keys: RedisKeys) -> Self {
        Self {
            pool,
            keys,
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl SlotLockManager for RedisLockManager {
    async fn acquire(&self, slot_id: Uuid, ttl: Duration) -> Result<LockAcquisition, BookingError> {
        let mut conn = get_connection(&self.pool).await?;
        let token = LockToken::generate();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let reply: Option<String> = redis::cmd("SET")
            .arg(self.keys.slot_lock(slot_id))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        match reply {
            Some(_) => {
                debug!("Slot lock acquired: {}", slot_id);
                Ok(LockAcquisition::Acquired(token))
            }
            None => {
                debug!("Slot lock {} is held, refusing acquisition", slot_id);
                Ok(LockAcquisition::Busy)
            }
        }
    }

    async fn release(&self, slot_id: Uuid, token: &LockToken) -> Result<LockRelease, BookingError> {
        let mut conn = get_connection(&self.pool).await?;

        let removed: i64 = self
            .release_script
            .key(self.keys.slot_lock(slot_id))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;

        if removed == 1 {
            debug!("Slot lock released: {}", slot_id);
            Ok(LockRelease::Released)
        } else {
            Ok(LockRelease::AlreadyExpired)
        }
    }
}
