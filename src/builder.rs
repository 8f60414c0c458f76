//! Cache System Builder
//!
//! Wires the durable store, local tier, upstream source, orchestrator,
//! coordinator and planner into a [`CacheSystem`].
//!
//! # Example: Using Defaults
//!
//! ```rust,no_run
//! use stopsearch_cache::CacheSystemBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let system = CacheSystemBuilder::new().build().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Remote Durable Tier
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stopsearch_cache::{CacheSystemBuilder, RemoteStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let remote = RemoteStore::new("http://127.0.0.1:8080", Duration::from_secs(10))?;
//!     let system = CacheSystemBuilder::new()
//!         .with_durable(Arc::new(remote))
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::backends::{MokaCache, SnapshotStore};
use crate::cache_manager::CacheManager;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::orchestrator::FetchOrchestrator;
use crate::planner::BatchPlanner;
use crate::traits::CacheStore;
use crate::upstream::{IncidentSource, PoliceApiSource};
use crate::CacheSystem;

/// Builder for [`CacheSystem`]
///
/// Anything not supplied is built from the [`Config`]:
/// - **durable tier**: `SnapshotStore` at `store.snapshot_path`
/// - **source**: `PoliceApiSource` against `fetch.base_url`
/// - **clock**: system time
#[derive(Default)]
pub struct CacheSystemBuilder {
    config: Config,
    durable: Option<Arc<dyn CacheStore>>,
    source: Option<Arc<dyn IncidentSource>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CacheSystemBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a custom durable tier
    #[must_use]
    pub fn with_durable(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Use a custom upstream source
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn IncidentSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Use a custom clock for entry timestamps
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// # Errors
    ///
    /// Returns an error if the default upstream client cannot be built.
    pub async fn build(self) -> Result<CacheSystem> {
        let Self {
            config,
            durable,
            source,
            clock,
        } = self;
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));

        let durable: Arc<dyn CacheStore> = match durable {
            Some(store) => store,
            None => Arc::new(SnapshotStore::new(config.store.clone(), clock.clone())),
        };
        let source: Arc<dyn IncidentSource> = match source {
            Some(source) => source,
            None => Arc::new(PoliceApiSource::new(&config.fetch).context("Failed to initialize upstream source")?),
        };
        info!(durable = durable.name(), source = source.name(), "Building cache system");

        let local = Arc::new(MokaCache::new(config.local, clock));
        let orchestrator = Arc::new(FetchOrchestrator::new(source, config.fetch.clone()));
        let cache_manager = Arc::new(CacheManager::new(
            durable.clone(),
            local.clone(),
            orchestrator.clone(),
            config.tier,
        ));
        let planner = Arc::new(BatchPlanner::new(cache_manager.clone(), config.planner));

        info!("Cache system built");
        Ok(CacheSystem {
            cache_manager,
            planner,
            orchestrator,
            durable,
            local,
            config,
        })
    }
}
