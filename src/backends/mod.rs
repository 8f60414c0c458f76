//! Cache Backend Implementations
//!
//! # Durable Tier
//! - **Snapshot** - single JSON file, rewritten atomically on each mutation
//! - **Remote** - HTTP client of a cache server's `/api/cache` endpoint
//!
//! # Local Tier
//! - **Moka** - in-process cache with per-key TTL and stale reads

pub mod moka_cache;
pub mod remote_store;
pub mod snapshot_store;

pub use moka_cache::{LocalStats, MokaCache, StaleEntry};
pub use remote_store::RemoteStore;
pub use snapshot_store::SnapshotStore;
