//! Stop-and-Search Cache
//!
//! Tiered caching and aggregation core for rate-limited stop-and-search open
//! data:
//! - **Durable tier**: JSON snapshot file, or a remote cache server over HTTP
//! - **Local tier**: in-process Moka cache with stale reads
//! - **Aggregation**: raw incidents → compact statistical summaries
//! - **Fetch orchestration**: call spacing, 429 backoff, circuit breaker
//! - **Stampede protection**: `DashMap` + Mutex request coalescing
//! - **Batch planning**: entity × period grids with bounded-concurrency waves
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use stopsearch_cache::{CacheSystem, Period};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let system = CacheSystem::new().await?;
//!
//!     let may: Period = "2024-05".parse()?;
//!     let served = system.cache_manager().get_aggregated("metropolitan", &may).await?;
//!     tracing::info!(total = served.record.total, source = ?served.source, "Served");
//!
//!     let grid = system
//!         .planner()
//!         .execute(&["kent".to_string(), "essex".to_string()], &[may])
//!         .await;
//!     tracing::info!(fetched = grid.fetched.len(), cached = grid.cached.len(), "Batch done");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Planner → Durable tier → Local tier → Orchestrator → Upstream
//!             ↓ Hit          ↓ Hit        ↓ Incidents
//!             Promote        Return       Aggregate, store in both tiers
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

pub mod aggregation;
pub mod backends;
pub mod builder;
pub mod cache_manager;
pub mod clock;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod server;
pub mod traits;
pub mod upstream;

pub use aggregation::{
    AggregatedRecord, GeoCluster, OverallRecord, RawIncident, aggregate, aggregate_for, aggregate_overall,
};
pub use backends::{MokaCache, RemoteStore, SnapshotStore};
pub use builder::CacheSystemBuilder;
pub use cache_manager::{
    CacheManager, CacheManagerStats, DATASETS_KEY, ServedFrom, ServedRecord, cache_key, parse_cache_key,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{ErrorKind, FetchError, StoreError};
pub use orchestrator::{ErrorRecord, FetchOrchestrator, FetchStats};
pub use planner::{BatchPlan, BatchPlanner, BatchProgress, BatchResult, PeriodStatus};
pub use traits::{BulkGet, CacheStore, EntryMeta, StoreStats, StoredEntry};
pub use upstream::{DatasetAvailability, IncidentSource, Period, PoliceApiSource, parse_datasets};

// Re-export async_trait for implementors of the store and source traits
pub use async_trait::async_trait;

/// Main entry point: every component, wired together
#[derive(Clone)]
pub struct CacheSystem {
    /// Multi-tier coordinator (primary interface)
    pub cache_manager: Arc<CacheManager>,
    pub planner: Arc<BatchPlanner>,
    pub orchestrator: Arc<FetchOrchestrator>,
    pub durable: Arc<dyn CacheStore>,
    pub local: Arc<MokaCache>,
    pub config: Config,
}

impl CacheSystem {
    /// Build with [`Config::from_env`] and default components
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the upstream
    /// client cannot be built.
    pub async fn new() -> Result<Self> {
        info!("Initializing Stop-and-Search Cache System");
        CacheSystemBuilder::new().with_config(Config::from_env()?).build().await
    }

    /// Check both tiers
    ///
    /// Returns `true` if at least the local tier is operational; a durable
    /// failure is tolerated.
    pub async fn health_check(&self) -> bool {
        let local_ok = self.local.health_check().await;
        let durable_ok = self.durable.health_check().await;

        if local_ok && durable_ok {
            info!("Cache system health check passed");
        } else {
            warn!(local_ok = %local_ok, durable_ok = %durable_ok, "Cache system health check - partial failure");
        }
        local_ok
    }

    #[must_use]
    pub fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }

    #[must_use]
    pub fn planner(&self) -> &Arc<BatchPlanner> {
        &self.planner
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<FetchOrchestrator> {
        &self.orchestrator
    }
}
