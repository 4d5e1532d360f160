use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use shared_config::AppConfig;
use slot_booking_cell::{
    create_redis_pool, AvailabilityCache, BookingConfig, BookingCoordinator, BookingState,
    BroadcastEventPublisher, ConsistencyService, EventPublisher, InMemoryLockManager,
    InMemorySlotStore, OutboxDispatcher, RedisEventPublisher, RedisKeys, RedisLockManager,
    RedisSlotStore, SlotLockManager, SlotStore,
};

struct Backends {
    store: Arc<dyn SlotStore>,
    locks: Arc<dyn SlotLockManager>,
    publisher: Arc<dyn EventPublisher>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Slot Booking API server");

    let config = AppConfig::from_env();
    let booking_config = BookingConfig::from(&config);
    let backends = build_backends(&config).await?;

    let outbox_wakeup = Arc::new(Notify::new());
    let cache = Arc::new(AvailabilityCache::new(backends.store.clone(), &booking_config));
    let coordinator = Arc::new(BookingCoordinator::new(
        backends.store.clone(),
        backends.locks.clone(),
        cache.clone(),
        outbox_wakeup.clone(),
        booking_config.clone(),
    ));
    let consistency = Arc::new(ConsistencyService::new(
        backends.store.clone(),
        backends.locks,
        cache,
        &booking_config,
    ));
    let dispatcher = Arc::new(OutboxDispatcher::new(
        backends.store,
        backends.publisher,
        outbox_wakeup,
        &booking_config,
    ));

    let dispatcher_task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run().await }
    });
    let sweeper_task = tokio::spawn({
        let consistency = consistency.clone();
        async move { consistency.run().await }
    });

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = Arc::new(BookingState {
        coordinator,
        consistency: consistency.clone(),
    });

    // Build the application router
    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Stopping background workers");
    dispatcher.shutdown().await;
    consistency.shutdown().await;
    // The sweeper may be parked on a long interval.
    sweeper_task.abort();
    if let Err(e) = dispatcher_task.await {
        warn!("Outbox dispatcher ended abnormally: {}", e);
    }

    Ok(())
}

async fn build_backends(config: &AppConfig) -> anyhow::Result<Backends> {
    if let Some(redis_url) = &config.redis_url {
        let pool = create_redis_pool(redis_url)
            .await
            .context("failed to connect to Redis")?;
        let keys = RedisKeys::new(config.redis_key_prefix.clone());
        info!("Using Redis slot store with key prefix {:?}", keys.prefix());

        return Ok(Backends {
            store: Arc::new(RedisSlotStore::new(pool.clone(), keys.clone())),
            locks: Arc::new(RedisLockManager::new(pool.clone(), keys.clone())),
            publisher: Arc::new(RedisEventPublisher::new(pool, keys)),
        });
    }

    let publisher = BroadcastEventPublisher::new(1024);
    let mut events = publisher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(record) => info!("Booking event {}: {:?}", record.id, record.event),
                Err(RecvError::Lagged(skipped)) => warn!("Event log fell behind by {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    Ok(Backends {
        store: Arc::new(InMemorySlotStore::new()),
        locks: Arc::new(InMemoryLockManager::new()),
        publisher: Arc::new(publisher),
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
