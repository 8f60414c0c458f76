//! Cache server binary
//!
//! Serves a snapshot store over `/api/cache`. Configured through
//! `STOPSEARCH_*` environment variables (see `Config::from_env`); log level
//! through `RUST_LOG`.

use std::sync::Arc;

use anyhow::Context;
use stopsearch_cache::{CacheStore, Config, SnapshotStore, SystemClock, server};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let store = Arc::new(SnapshotStore::new(config.store.clone(), Arc::new(SystemClock)));
    if !store.health_check().await {
        error!(path = %store.path().display(), "Snapshot store failed its health check");
    }

    let app = server::router(store, config.store.default_ttl);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting stopsearch-cache-server");
    server::serve(listener, app).await
}
