//! Snapshot Store - Durable Tier
//!
//! The whole store is one JSON object `key -> {data, timestamp, ttl, source?}`
//! (milliseconds) in a single file. Every mutation rewrites the file
//! atomically: temp file in the same directory, fsync, rename.
//!
//! Mutations within the process are serialized by a store-wide async mutex.
//! A missing or unparsable snapshot is treated as an empty store. Any other
//! read failure makes reads miss and mutations fail, leaving the file intact.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, duration_millis};
use crate::config::StoreConfig;
use crate::error::{ErrorKind, StoreError};
use crate::traits::{BulkGet, CacheStore, EntryMeta, EntryStamp, StoreStats, StoredEntry};

/// On-disk entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SnapshotEntry {
    data: Value,
    /// Creation time, ms since epoch
    timestamp: u64,
    /// ms
    ttl: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

impl SnapshotEntry {
    fn is_valid(&self, now: u64) -> bool {
        now.saturating_sub(self.timestamp) < self.ttl
    }

    fn meta(&self) -> EntryMeta {
        EntryMeta {
            timestamp: self.timestamp,
            ttl: self.ttl,
        }
    }
}

type Snapshot = BTreeMap<String, SnapshotEntry>;

/// Single-file JSON snapshot store
pub struct SnapshotStore {
    path: PathBuf,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    source_tag: Option<String>,
    lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
}

impl SnapshotStore {
    pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        info!(path = %config.snapshot_path.display(), "Snapshot store initialized");
        Self {
            path: config.snapshot_path.clone(),
            config,
            clock,
            source_tag: None,
            lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Tag every entry written by this store with a source label
    #[must_use]
    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.source_tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot writes performed so far
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// (hits, misses) of `get` and `get_multiple` lookups
    #[must_use]
    pub fn hit_counts(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }

    async fn load(&self) -> Snapshot {
        match self.read_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "[Snapshot] Read failed, treating store as empty");
                Snapshot::new()
            }
        }
    }

    /// Snapshot to mutate; unreadable files are an error so a write never
    /// replaces data it could not see
    async fn load_for_write(&self) -> Result<Snapshot, StoreError> {
        self.read_snapshot().await
    }

    async fn read_snapshot(&self) -> Result<Snapshot, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    kind = %ErrorKind::StoreCorrupt,
                    error = %e,
                    "[Snapshot] Unparsable snapshot, treating store as empty"
                );
                Ok(Snapshot::new())
            }
        }
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn entry(&self, value: Value, ttl: Duration, now: u64) -> SnapshotEntry {
        SnapshotEntry {
            data: value,
            timestamp: now,
            ttl: duration_millis(ttl),
            source: self.source_tag.clone(),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl CacheStore for SnapshotStore {
    async fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    async fn get_entry(&self, key: &str) -> Option<StoredEntry> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.load().await;
        let now = self.clock.now_millis();

        let valid = snapshot.get(key).map(|entry| entry.is_valid(now));
        match valid {
            Some(true) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                snapshot.remove(key).map(|entry| StoredEntry {
                    meta: Some(entry.meta()),
                    value: entry.data,
                })
            }
            Some(false) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                snapshot.remove(key);
                if let Err(e) = self.persist(&snapshot).await {
                    warn!(key = %key, error = %e, "[Snapshot] Failed to persist eviction");
                }
                debug!(key = %key, "[Snapshot] Evicted expired entry");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.load_for_write().await?;
        let now = self.clock.now_millis();
        snapshot.insert(key.to_string(), self.entry(value, ttl, now));
        self.persist(&snapshot).await?;
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[Snapshot] Cached key with TTL");
        Ok(snapshot.len())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.load_for_write().await?;
        if snapshot.remove(key).is_some() {
            self.persist(&snapshot).await?;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.persist(&Snapshot::new()).await?;
        info!(path = %self.path.display(), "[Snapshot] Cleared");
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let _guard = self.lock.lock().await;
        let snapshot = self.load().await;

        let stamp = |(key, entry): (&String, &SnapshotEntry)| EntryStamp {
            key: key.clone(),
            timestamp: entry.timestamp,
        };
        // min_by_key keeps the first minimum, max_by_key the last maximum
        let oldest_entry = snapshot.iter().min_by_key(|(_, e)| e.timestamp).map(stamp);
        let newest_entry = snapshot.iter().max_by_key(|(_, e)| e.timestamp).map(stamp);

        Ok(StoreStats {
            size: snapshot.len(),
            max_size: self.config.max_size,
            keys: snapshot.keys().cloned().collect(),
            oldest_entry,
            newest_entry,
        })
    }

    async fn get_multiple(&self, keys: &[String]) -> BulkGet {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.load().await;
        let now = self.clock.now_millis();

        let mut cached = BTreeMap::new();
        let mut stamps = BTreeMap::new();
        let mut missing = Vec::new();
        let mut evicted = false;
        for key in keys {
            match snapshot.get(key) {
                Some(entry) if entry.is_valid(now) => {
                    cached.insert(key.clone(), entry.data.clone());
                    stamps.insert(key.clone(), entry.meta());
                }
                Some(_) => {
                    snapshot.remove(key);
                    evicted = true;
                    missing.push(key.clone());
                }
                None => missing.push(key.clone()),
            }
        }

        if evicted {
            if let Err(e) = self.persist(&snapshot).await {
                warn!(error = %e, "[Snapshot] Failed to persist bulk eviction");
            }
        }

        self.hits.fetch_add(cached.len() as u64, Ordering::Relaxed);
        self.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);
        debug!(requested = keys.len(), cached = cached.len(), "[Snapshot] Bulk lookup");
        BulkGet::new(cached, missing, keys.len()).with_stamps(stamps)
    }

    async fn set_multiple(&self, entries: BTreeMap<String, Value>, ttl: Duration) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut snapshot = self.load_for_write().await?;
        let now = self.clock.now_millis();
        let count = entries.len();
        for (key, value) in entries {
            let entry = self.entry(value, ttl, now);
            snapshot.insert(key, entry);
        }
        self.persist(&snapshot).await?;
        debug!(count, ttl_secs = %ttl.as_secs(), "[Snapshot] Cached keys in bulk");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let test_key = "health_check_snapshot";
        let test_value = serde_json::json!({"test": true});

        match self.set(test_key, test_value.clone(), Duration::from_secs(60)).await {
            Ok(_) => {
                let retrieved = self.get(test_key).await;
                let _ = self.delete(test_key).await;
                retrieved.as_ref() == Some(&test_value)
            }
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "Snapshot"
    }
}
