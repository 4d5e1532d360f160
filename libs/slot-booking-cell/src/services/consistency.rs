// libs/slot-booking-cell/src/services/consistency.rs
//
// Background repair and health reporting for the booking core.
//
// An orphaned reservation is a slot marked booked with no live appointment
// claiming it. The coordinator cannot produce one on its own because the slot
// flag and the appointment are written together, but imports and manual edits
// can. The sweep frees such slots with the same version check bookings use,
// so it never overrides a booking that lands while it runs.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::services::cache::AvailabilityCache;
use crate::services::lock::SlotLockManager;
use crate::services::slot_store::SlotStore;
use crate::{BookingConfig, BookingError, BookingHealth, SchedulingHealth, SweepReport};

/// Backlog past which event delivery is considered to be falling behind.
const OUTBOX_BACKLOG_BATCHES: u64 = 10;

pub struct ConsistencyService {
    store: Arc<dyn SlotStore>,
    locks: Arc<dyn SlotLockManager>,
    cache: Arc<AvailabilityCache>,
    sweep_interval: Duration,
    outbox_batch_size: usize,
    stuck_after_attempts: u32,
    is_shutdown: RwLock<bool>,
}

impl ConsistencyService {
    pub fn new(
        store: Arc<dyn SlotStore>,
        locks: Arc<dyn SlotLockManager>,
        cache: Arc<AvailabilityCache>,
        config: &BookingConfig,
    ) -> Self {
        Self {
            store,
            locks,
            cache,
            sweep_interval: config.sweep_interval,
            outbox_batch_size: config.outbox_batch_size.max(1),
            stuck_after_attempts: config.outbox_stuck_after_attempts,
            is_shutdown: RwLock::new(false),
        }
    }

    /// Free every booked slot that no live appointment claims, and drop lock
    /// handles left behind by holders that never released them.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, BookingError> {
        let expired_locks_purged = self.locks.purge_expired().await?;
        if expired_locks_purged > 0 {
            debug!("Purged {} expired slot locks", expired_locks_purged);
        }

        let orphans = self.store.find_orphaned_reservations().await?;
        let mut report = SweepReport {
            orphans_found: orphans.len(),
            expired_locks_purged,
            ..Default::default()
        };

        for slot in orphans {
            match self.store.release_orphan(slot.id, slot.version()).await? {
                Some(new_version) => {
                    warn!(
                        "Released orphaned reservation on slot {} (version {} -> {})",
                        slot.id,
                        slot.version(),
                        new_version
                    );
                    self.cache.invalidate(slot.doctor_id, slot.window()).await;
                    report.orphans_released += 1;
                }
                None => {
                    debug!("Slot {} changed during sweep, leaving it", slot.id);
                }
            }
        }

        if report.orphans_found > 0 {
            info!(
                "Consistency sweep released {}/{} orphaned reservations",
                report.orphans_released, report.orphans_found
            );
        }
        Ok(report)
    }

    pub async fn health(&self) -> Result<SchedulingHealth, BookingError> {
        let outbox_depth = self.store.outbox_depth().await?;
        let stuck_outbox_records = self
            .store
            .pending_outbox(self.outbox_batch_size)
            .await?
            .iter()
            .filter(|record| record.attempts >= self.stuck_after_attempts)
            .count();
        let orphaned_reservations = self.store.find_orphaned_reservations().await?.len();
        let cache = self.cache.stats().await;

        let status = if stuck_outbox_records > 0 {
            BookingHealth::Critical(format!(
                "{} booking events failed delivery {} or more times",
                stuck_outbox_records, self.stuck_after_attempts
            ))
        } else if orphaned_reservations > 0 {
            BookingHealth::Degraded(format!("{} slots booked without an appointment", orphaned_reservations))
        } else if outbox_depth > self.outbox_batch_size as u64 * OUTBOX_BACKLOG_BATCHES {
            BookingHealth::Degraded(format!("{} booking events awaiting delivery", outbox_depth))
        } else {
            BookingHealth::Healthy
        };

        Ok(SchedulingHealth {
            status,
            outbox_depth,
            stuck_outbox_records,
            orphaned_reservations,
            cache,
            checked_at: Utc::now(),
        })
    }

    pub async fn run(&self) {
        info!("Starting consistency sweeper every {:?}", self.sweep_interval);

        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if *self.is_shutdown.read().await {
                break;
            }

            if let Err(e) = self.sweep().await {
                error!("Consistency sweep failed: {}", e);
            }
        }

        info!("Consistency sweeper stopped");
    }

    pub async fn shutdown(&self) {
        *self.is_shutdown.write().await = true;
    }
}
