mod config;
mod error;
mod identity;
mod routes;
mod worker;

use std::sync::Arc;

use civic_sync_core::db::Database;
use civic_sync_core::sync::EntityTypeAllowList;
use civic_sync_core::SyncEngine;
use config::AppConfig;
use routes::{app_router, AppState};
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("civic_sync_api=info".parse()?)
                .add_directive("civic_sync_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting civic-sync-api with config: {:?}", config);

    let db = Arc::new(Database::open(&config.database_path).await?);
    let authorizer = EntityTypeAllowList::new(
        config.readable_types.clone(),
        config.writable_types.clone(),
    );
    let engine = Arc::new(
        SyncEngine::local(db, config.sync.clone()).with_authorizer(Arc::new(authorizer)),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = worker::spawn(
        Arc::clone(&engine),
        config.worker_interval,
        config.worker_batch_size,
        shutdown_rx,
    );

    let state = AppState::new(Arc::clone(&config), engine);
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("civic-sync-api listening on {}", config.bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    worker.await?;
    tracing::info!("civic-sync-api shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
