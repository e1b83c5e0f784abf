//! Outbox API - user creation over HTTP.
//!
//! Creates users and their `user_created` outbox rows in one transaction.
//! Publishing is left to `outbox-publisher`.
//!
//! ## Configuration
//!
//! See [`outbox_relay::config`]. Relevant here: `DATABASE_URL`, `PORT`,
//! `LOG_LEVEL`.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

use outbox_relay::api::{self, AppState};
use outbox_relay::store::postgres::{
    self, PgOutboxStore, PgTransactionManager, PgUserRepository,
};
use outbox_relay::store::UnitOfWork;
use outbox_relay::{logging, AppConfig, ShutdownSignal, UserService};

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

    let service = UserService::new(
        Arc::new(PgUserRepository::new(pool.clone())),
        Arc::new(PgOutboxStore::new(pool.clone())),
        UnitOfWork::new(Arc::new(PgTransactionManager::new(pool.clone()))),
    );
    let app = api::router(AppState::new(Arc::new(service)));

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen_for_os_signals());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Outbox API listening");

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });

    match shutdown.drain(server).await {
        Some(result) => {
            result?;
            info!("Server stopped");
        }
        None => warn!("Server stopped with requests still in flight"),
    }

    pool.close().await;
    Ok(())
}
