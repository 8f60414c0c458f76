//! Cache Store Trait
//!
//! The durable tier is any implementation of [`CacheStore`]. Two ship with the
//! crate:
//!
//! - `SnapshotStore`: a single JSON snapshot file rewritten atomically
//! - `RemoteStore`: HTTP client of the `/api/cache` wire protocol
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! use stopsearch_cache::{CacheStore, StoreError, async_trait};
//! use std::time::Duration;
//!
//! struct MyStore;
//!
//! #[async_trait]
//! impl CacheStore for MyStore {
//!     async fn get(&self, key: &str) -> Option<serde_json::Value> {
//!         // Your implementation
//!     }
//!
//!     async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> Result<usize, StoreError> {
//!         // Your implementation
//!     }
//!
//!     // ... delete, clear, stats, get_multiple, set_multiple, health_check
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Key and creation time of one entry, as reported by `stats`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStamp {
    pub key: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

/// Creation time and lifetime of a stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Milliseconds
    pub ttl: u64,
}

impl EntryMeta {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }
}

/// Value plus its metadata, when the store can report it
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub value: Value,
    pub meta: Option<EntryMeta>,
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub size: usize,
    /// Advisory capacity, not enforced
    pub max_size: usize,
    pub keys: Vec<String>,
    pub oldest_entry: Option<EntryStamp>,
    pub newest_entry: Option<EntryStamp>,
}

/// Result of a bulk lookup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkGet {
    pub cached: BTreeMap<String, Value>,
    pub cached_count: usize,
    /// Requested keys with no current entry, in request order
    pub missing_keys: Vec<String>,
    pub total_requested: usize,
    /// Metadata of cached keys, for stores that track it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stamps: BTreeMap<String, EntryMeta>,
}

impl BulkGet {
    #[must_use]
    pub fn new(cached: BTreeMap<String, Value>, missing_keys: Vec<String>, total_requested: usize) -> Self {
        Self {
            cached_count: cached.len(),
            cached,
            missing_keys,
            total_requested,
            stamps: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_stamps(mut self, stamps: BTreeMap<String, EntryMeta>) -> Self {
        self.stamps = stamps;
        self
    }

    /// Every key reported missing
    #[must_use]
    pub fn all_missing(keys: &[String]) -> Self {
        Self::new(BTreeMap::new(), keys.to_vec(), keys.len())
    }
}

/// Durable key/value store with per-entry TTL
///
/// Absence is never an error: missing and expired keys are reported as
/// `None` or listed in [`BulkGet::missing_keys`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Current value for `key`; expired entries are evicted and reported missing
    async fn get(&self, key: &str) -> Option<Value>;

    /// [`Self::get`] plus the entry's creation time and TTL
    ///
    /// The default reports no metadata.
    async fn get_entry(&self, key: &str) -> Option<StoredEntry> {
        self.get(key).await.map(|value| StoredEntry { value, meta: None })
    }

    /// Insert or overwrite `key`; returns the store size afterwards
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<usize, StoreError>;

    /// Remove `key` (no-op if absent)
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every entry
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    async fn clear(&self) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns an error if the store cannot be inspected.
    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// Look up many keys at once
    async fn get_multiple(&self, keys: &[String]) -> BulkGet;

    /// Insert or overwrite many keys with one TTL, as a single write
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    async fn set_multiple(&self, entries: BTreeMap<String, Value>, ttl: Duration) -> Result<(), StoreError>;

    /// Whether the store is operational
    async fn health_check(&self) -> bool;

    /// Name for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}
