//! Doc Sync Server binary
//!
//! Reads configuration from the environment, opens the update log and
//! serves the sync protocol until interrupted. On shutdown every open
//! document is flushed and compacted before the process exits.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, warn};

use doc_sync_server::{
    router, ActorRegistry, AppState, DocumentRepository, MemoryRepository, RecordAccessPolicy,
    ServerConfig, SledRepository, StorageBackend, UpdateLog,
};

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doc_sync_server=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;

    // Initialize storage
    let repo: Arc<dyn DocumentRepository> = match config.storage_backend {
        StorageBackend::Sled => {
            info!("Initializing storage at: {}", config.storage.path);
            Arc::new(
                SledRepository::open(config.storage.clone()).context("failed to open storage")?,
            )
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; documents will not survive a restart");
            Arc::new(MemoryRepository::new())
        }
    };

    let registry = Arc::new(ActorRegistry::new(
        UpdateLog::new(repo.clone()),
        config.actor.clone(),
    ));
    let access = Arc::new(RecordAccessPolicy::new(repo));
    let state = Arc::new(AppState::new(registry.clone(), access));
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Doc sync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:document_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    // Terminating the actors closes their sockets, so open connections
    // drain before the server stops waiting on them
    let shutdown_registry = registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Flushing open documents");
            shutdown_registry.shutdown_all().await;
        })
        .await
        .context("server error")?;

    // Actors started while the listener was closing
    registry.shutdown_all().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
