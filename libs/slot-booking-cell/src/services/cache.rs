// libs/slot-booking-cell/src/services/cache.rs
//
// Read-through projection of bookable slots per (doctor, window). Never
// consulted for a booking decision; the coordinator always goes back to the
// slot store before committing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::future::Cache;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::services::slot_store::SlotStore;
use crate::{BookingConfig, BookingError, CacheStats, SlotSummary, TimeWindow};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    doctor_id: Uuid,
    window: TimeWindow,
}

pub struct AvailabilityCache {
    store: Arc<dyn SlotStore>,
    /// Hot listings, expired after the TTL and bounded by `cache_max_entries`.
    entries: Cache<CacheKey, Arc<Vec<SlotSummary>>>,
    /// Bumped on every invalidation of a doctor. A populate that read the
    /// store under an older generation is dropped. Held across the
    /// check-and-insert so an invalidation cannot slip in between.
    generations: Mutex<HashMap<Uuid, u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    discarded_populates: AtomicU64,
}

impl AvailabilityCache {
    pub fn new(store: Arc<dyn SlotStore>, config: &BookingConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.cache_max_entries)
            .time_to_live(config.cache_ttl)
            .build();

        Self {
            store,
            entries,
            generations: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            discarded_populates: AtomicU64::new(0),
        }
    }

    /// Bookable slots of `doctor_id` starting inside `window`, earliest first.
    pub async fn list(&self, doctor_id: Uuid, window: TimeWindow) -> Result<Vec<SlotSummary>, BookingError> {
        let key = CacheKey { doctor_id, window };

        if let Some(slots) = self.entries.get(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(slots.as_ref().clone());
        }

        let generation = self.generation(doctor_id).await;

        self.misses.fetch_add(1, Ordering::Relaxed);
        let slots: Vec<SlotSummary> = self
            .store
            .list_slots(doctor_id, &window)
            .await?
            .into_iter()
            .filter(|slot| !slot.is_booked())
            .map(|slot| slot.summary())
            .collect();

        let generations = self.generations.lock().await;
        let current = generations.get(&doctor_id).copied().unwrap_or(0);
        if current == generation {
            self.entries.insert(key, Arc::new(slots.clone())).await;
        } else {
            self.discarded_populates.fetch_add(1, Ordering::Relaxed);
            debug!("Discarding availability populate for doctor {} raced by invalidation", doctor_id);
        }

        Ok(slots)
    }

    /// Drop every cached window of `doctor_id` overlapping `window`.
    pub async fn invalidate(&self, doctor_id: Uuid, window: TimeWindow) {
        let mut generations = self.generations.lock().await;
        *generations.entry(doctor_id).or_insert(0) += 1;

        let stale: Vec<Arc<CacheKey>> = self
            .entries
            .iter()
            .filter(|(key, _)| key.doctor_id == doctor_id && key.window.overlaps(&window))
            .map(|(key, _)| key)
            .collect();
        for key in &stale {
            self.entries.invalidate(key.as_ref()).await;
        }
        drop(generations);

        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!("Invalidated {} availability entries for doctor {}", stale.len(), doctor_id);
    }

    pub async fn stats(&self) -> CacheStats {
        // Apply pending evictions so the count reflects TTL and capacity.
        self.entries.run_pending_tasks().await;

        CacheStats {
            entries: self.entries.entry_count() as usize,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            discarded_populates: self.discarded_populates.load(Ordering::Relaxed),
        }
    }

    async fn generation(&self, doctor_id: Uuid) -> u64 {
        self.generations.lock().await.get(&doctor_id).copied().unwrap_or(0)
    }
}
