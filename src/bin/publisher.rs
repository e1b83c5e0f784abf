//! Outbox Publisher - relays outbox rows into the event stream.
//!
//! Every `PUBLISHER_POLL_INTERVAL` it fetches up to `PUBLISHER_BATCH_SIZE`
//! unpublished rows, appends them to `user:events` in id order and marks
//! them published.
//!
//! Unreachable PostgreSQL or Redis at startup is fatal. Failures during a
//! tick are logged and retried on the next tick.

use std::sync::Arc;
use tracing::{error, info, info_span, warn};

use outbox_relay::broker::redis::RedisBroker;
use outbox_relay::store::postgres::{self, PgOutboxStore};
use outbox_relay::{logging, AppConfig, OutboxPublisher, ShutdownSignal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    logging::init(&config.log_level)?;

    let pool = postgres::connect(&config.database.url, config.database.max_connections)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to database");
            e
        })?;
    postgres::run_migrations(&pool).await?;

    let redis_url = config.redis.url();
    let broker = RedisBroker::connect(&redis_url).await.map_err(|e| {
        error!(error = %e, "Failed to connect to Redis");
        e
    })?;

    let publisher_config = config.publisher_config();
    let span = info_span!(
        "publisher",
        stream = %publisher_config.stream,
        pid = std::process::id()
    );
    let publisher = OutboxPublisher::new(
        Arc::new(PgOutboxStore::new(pool.clone())),
        Arc::new(broker),
        publisher_config,
    )
    .with_span(span);

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen_for_os_signals());

    match shutdown.drain(publisher.run(shutdown.clone())).await {
        Some(stats) => info!(
            ticks = stats.ticks,
            published = stats.published,
            "Publisher shutdown complete"
        ),
        None => warn!("Publisher stopped before its last batch finished"),
    }

    pool.close().await;
    Ok(())
}
