//! Moka Cache - Local Tier
//!
//! In-process cache holding each value with its creation time and TTL, so an
//! entry past its TTL can still be served stale while a refetch is failing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::{Clock, duration_millis};
use crate::config::LocalCacheConfig;

/// Cache entry with creation time
#[derive(Debug, Clone)]
struct LocalEntry {
    value: Value,
    created_at: u64,
    ttl_ms: u64,
}

impl LocalEntry {
    fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    fn is_fresh(&self, now: u64) -> bool {
        self.age(now) < self.ttl_ms
    }
}

/// Entry past its TTL but still inside the stale window
#[derive(Debug, Clone, PartialEq)]
pub struct StaleEntry {
    pub value: Value,
    pub age: Duration,
}

/// Local tier counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub size: u64,
}

/// Moka in-memory cache with per-key TTL and stale reads
pub struct MokaCache {
    cache: Cache<String, LocalEntry>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

impl MokaCache {
    pub fn new(config: LocalCacheConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = Cache::builder().max_capacity(config.max_capacity).build();

        info!(capacity = config.max_capacity, "Moka local tier initialized");

        Self {
            cache,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    /// Fresh value for `key`; entries past their TTL are kept for stale reads
    pub async fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_millis();
        match self.cache.get(key).await {
            Some(entry) if entry.is_fresh(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Value for `key` if younger than `window`, whatever its TTL
    ///
    /// Entries older than `window` are evicted.
    pub async fn get_stale(&self, key: &str, window: Duration) -> Option<StaleEntry> {
        let entry = self.cache.get(key).await?;
        let age = entry.age(self.clock.now_millis());
        if age >= duration_millis(window) {
            self.cache.remove(key).await;
            debug!(key = %key, age_ms = age, "[Moka] Evicted entry beyond stale window");
            return None;
        }
        Some(StaleEntry {
            value: entry.value,
            age: Duration::from_millis(age),
        })
    }

    /// Insert or overwrite `key`, stamped with the current time
    pub async fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.set_stamped(key, value, self.clock.now_millis(), ttl).await;
    }

    /// Insert or overwrite `key` with an existing creation time
    ///
    /// Used when copying an entry from another tier, so its age carries over.
    pub async fn set_stamped(&self, key: &str, value: Value, created_at: u64, ttl: Duration) {
        let entry = LocalEntry {
            value,
            created_at,
            ttl_ms: duration_millis(ttl),
        };
        self.cache.insert(key.to_string(), entry).await;
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, created_at, ttl_secs = %ttl.as_secs(), "[Moka] Cached key with TTL");
    }

    pub async fn remove(&self, key: &str) {
        self.cache.remove(key).await;
    }

    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    #[must_use]
    pub fn stats(&self) -> LocalStats {
        LocalStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            size: self.cache.entry_count(),
        }
    }

    pub async fn health_check(&self) -> bool {
        let test_key = "health_check_moka";
        let test_value = serde_json::json!({"test": true});

        self.set(test_key, test_value.clone(), Duration::from_secs(60)).await;
        let retrieved = self.get(test_key).await;
        self.remove(test_key).await;
        retrieved.as_ref() == Some(&test_value)
    }

    pub fn name(&self) -> &'static str {
        "Moka"
    }
}
