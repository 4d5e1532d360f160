// libs/slot-booking-cell/src/services/outbox.rs
//
// Delivers outbox records recorded alongside committed booking changes.
// Delivery is at-least-once: a record is removed only after its publisher
// accepted it, so consumers must be idempotent on appointment id.

use std::sync::Arc;

use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::services::redis_pool::{get_connection, RedisKeys};
use crate::services::slot_store::SlotStore;
use crate::{BookingConfig, BookingError, DispatchReport, OutboxRecord};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, record: &OutboxRecord) -> Result<(), BookingError>;
}

// ==============================================================================
// PUBLISHERS
// ==============================================================================

/// Fans records out to in-process subscribers.
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<OutboxRecord>,
}

impl BroadcastEventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboxRecord> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, record: &OutboxRecord) -> Result<(), BookingError> {
        // With nobody listening the record stays in the outbox for the next pass.
        self.sender
            .send(record.clone())
            .map(|receivers| debug!("Event {} delivered to {} subscribers", record.id, receivers))
            .map_err(|_| BookingError::EventDelivery("No subscribers for booking events".to_string()))
    }
}

/// Pushes records onto a Redis list read by the notification and payment services.
pub struct RedisEventPublisher {
    pool: Pool,
    keys: RedisKeys,
}

impl RedisEventPublisher {
    pub fn new(pool: Pool, keys: RedisKeys) -> Self {
        Self { pool, keys }
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    async fn publish(&self, record: &OutboxRecord) -> Result<(), BookingError> {
        let mut conn = get_connection(&self.pool).await?;
        let payload = serde_json::to_string(record)?;

        let _: () = conn.lpush(self.keys.outbound_events(), payload).await?;

        debug!("Event {} ({}) pushed to outbound queue", record.id, record.event.event_type());
        Ok(())
    }
}

// ==============================================================================
// DISPATCHER
// ==============================================================================

pub struct OutboxDispatcher {
    store: Arc<dyn SlotStore>,
    publisher: Arc<dyn EventPublisher>,
    wakeup: Arc<Notify>,
    poll_interval: Duration,
    batch_size: usize,
    stuck_after_attempts: u32,
    is_shutdown: RwLock<bool>,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn SlotStore>,
        publisher: Arc<dyn EventPublisher>,
        wakeup: Arc<Notify>,
        config: &BookingConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            wakeup,
            poll_interval: config.outbox_poll_interval,
            batch_size: config.outbox_batch_size.max(1),
            stuck_after_attempts: config.outbox_stuck_after_attempts,
            is_shutdown: RwLock::new(false),
        }
    }

    /// Deliver one batch, oldest first. Stops at the first failure so a later
    /// event for an appointment never overtakes an earlier one.
    #[instrument(skip(self))]
    pub async fn dispatch_pending(&self) -> Result<DispatchReport, BookingError> {
        let records = self.store.pending_outbox(self.batch_size).await?;
        let mut report = DispatchReport::default();
        let mut delivered = Vec::with_capacity(records.len());

        for record in &records {
            match self.publisher.publish(record).await {
                Ok(()) => delivered.push(record.id),
                Err(e) => {
                    report.failed += 1;
                    let attempts = record.attempts + 1;
                    if attempts >= self.stuck_after_attempts {
                        error!(
                            "Outbox record {} ({}) stuck after {} attempts: {}",
                            record.id,
                            record.event.event_type(),
                            attempts,
                            e
                        );
                    } else if e.is_retryable() {
                        warn!("Failed to deliver outbox record {}: {}", record.id, e);
                    } else {
                        error!("Outbox record {} rejected by publisher: {}", record.id, e);
                    }
                    self.store.record_delivery_failure(record.id, &e.to_string()).await?;
                    break;
                }
            }
        }

        if !delivered.is_empty() {
            self.store.mark_dispatched(&delivered).await?;
        }
        report.delivered = delivered.len();

        if report.delivered > 0 {
            debug!("Delivered {} outbox records", report.delivered);
        }
        Ok(report)
    }

    /// Poll until shutdown, waking early when the coordinator commits.
    pub async fn run(&self) {
        info!("Starting outbox dispatcher");

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wakeup.notified() => {}
            }

            if *self.is_shutdown.read().await {
                break;
            }

            // Keep draining while full batches come back.
            loop {
                match self.dispatch_pending().await {
                    Ok(report) if report.failed == 0 && report.delivered >= self.batch_size => continue,
                    Ok(_) => break,
                    Err(e) => {
                        error!("Outbox dispatch pass failed: {}", e);
                        break;
                    }
                }
            }
        }

        info!("Outbox dispatcher stopped");
    }

    pub async fn shutdown(&self) {
        *self.is_shutdown.write().await = true;
        self.wakeup.notify_one();
    }
}
