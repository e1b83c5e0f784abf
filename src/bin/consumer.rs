//! Outbox Consumer - welcome emails for new users.
//!
//! Reads `user:events` through the `email-service` consumer group and sends
//! a welcome email for every `user_created` event. Entries that fail are
//! left pending in the group.
//!
//! ## Configuration
//!
//! - `REDIS_ADDR` / `REDIS_URL`: Redis location
//! - `CONSUMER_NAME`: name within the group (default: "consumer-1")
//! - `MAIL_WEBHOOK_URL`: deliver emails over HTTP instead of logging them

use std::sync::Arc;
use tracing::{error, info, info_span, warn};

use outbox_relay::broker::redis::RedisBroker;
use outbox_relay::handlers::{LogMailer, Mailer, WebhookMailer, WelcomeEmailHandler};
use outbox_relay::{
    logging, AppConfig, Dispatcher, ShutdownSignal, StreamConsumer, UserCreatedEvent,
};

/// Build the mailer from configuration.
fn build_mailer(config: &AppConfig) -> Arc<dyn Mailer> {
    match config.mail.webhook() {
        Some(url) => {
            info!(url = %url, "Sending welcome emails through webhook");
            Arc::new(
                WebhookMailer::new(url)
                    .with_timeout(config.mail.timeout())
                    .with_retries(config.mail.retries),
            )
        }
        None => {
            info!("MAIL_WEBHOOK_URL not set, welcome emails will only be logged");
            Arc::new(LogMailer::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    logging::init(&config.log_level)?;

    let redis_url = config.redis.url();
    let broker = RedisBroker::connect(&redis_url).await.map_err(|e| {
        error!(error = %e, "Failed to connect to Redis");
        e
    })?;

    let mut dispatcher = Dispatcher::new();
    dispatcher.register::<UserCreatedEvent, _>(WelcomeEmailHandler::new(build_mailer(&config)));
    info!(event_types = ?dispatcher.event_types(), "Dispatcher configured");

    let consumer_config = config.consumer_config();
    let span = info_span!(
        "consumer",
        stream = %consumer_config.stream,
        group = %consumer_config.group,
        consumer = %consumer_config.consumer_name,
        pid = std::process::id()
    );
    let consumer = StreamConsumer::new(Arc::new(broker), Arc::new(dispatcher), consumer_config)
        .with_span(span);

    consumer.setup().await.map_err(|e| {
        error!(error = %e, "Failed to set up consumer group");
        e
    })?;

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen_for_os_signals());

    match shutdown.drain(consumer.run(shutdown.clone())).await {
        Some(stats) => info!(
            received = stats.received,
            acked = stats.acked,
            failed = stats.failed,
            "Consumer shutdown complete"
        ),
        None => warn!("Consumer stopped while an entry was still being handled"),
    }
    Ok(())
}
