mod api;
mod chain;
mod config;
mod db;
mod models;
mod sync;
mod tasks;

use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;

use chain::{EventSource, rpc::RpcEventSource};
use config::Config;
use db::Database;

// Wait for SIGINT or SIGTERM so the HTTP server can drain before the
// background tasks are torn down.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down..."),
        () = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            return;
        }
    };

    let database = match Database::connect(&config.database_url).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to initialize database: {e}");
            return;
        }
    };

    let source: Arc<dyn EventSource> = Arc::new(RpcEventSource::new(&config));

    // Mirror history before serving live traffic. If the source is down we
    // still serve whatever the cache already holds; the subscriber's gap
    // replay covers the same window once the source comes back.
    let cursor = match sync::backfill::run(&database, source.as_ref(), &config).await {
        Ok(latest) => latest + 1,
        Err(e) => {
            warn!("Historical sync failed: {e}; serving cached data and retrying via gap replay");
            config.start_block
        }
    };

    let subscriber = tokio::spawn(sync::subscriber::run(
        Arc::clone(&database),
        Arc::clone(&source),
        config.clone(),
        cursor,
    ));
    let reconciler = tokio::spawn(tasks::reconciler::run(
        Arc::clone(&database),
        Arc::clone(&source),
        config.reconcile_interval_secs,
    ));

    let app = api::router(Arc::clone(&database));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {addr}: {e}");
            return;
        }
    };
    info!("Server running on port {}", config.port);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {e}");
    }

    // Both loops only touch the store through idempotent operations, so
    // killing them at any await point is safe; a restart replays backfill.
    subscriber.abort();
    reconciler.abort();
    info!("Shutdown complete");
}
