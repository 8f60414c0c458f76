//! Cache Manager - Multi-Tier Coordinator
//!
//! Serves aggregated records from the durable tier, then the local tier, and
//! on a full miss fetches from upstream, aggregates and writes both tiers.
//! Concurrent misses on the same key are coalesced into one upstream fetch.
//! When a fetch fails, a local entry inside the stale window is served instead.
//!
//! Entries promoted from the durable tier keep their original creation time,
//! so promotion never extends a record's life. `Period::Latest` is resolved to
//! the newest published month before any key is built; the list of published
//! months is itself cached with a short TTL.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::aggregation::{AggregatedRecord, aggregate_for};
use crate::backends::MokaCache;
use crate::config::TierConfig;
use crate::error::{ErrorKind, FetchError};
use crate::orchestrator::FetchOrchestrator;
use crate::traits::{CacheStore, EntryMeta};
use crate::upstream::{DatasetAvailability, Period};

const KEY_PREFIX: &str = "aggregated";

/// Cache key of the published-months list
pub const DATASETS_KEY: &str = "datasets:available";

/// Cache key for one entity and period: `aggregated:{entity}:{period}`
#[must_use]
pub fn cache_key(entity_id: &str, period: &Period) -> String {
    record_key(entity_id, period)
}

pub(crate) fn record_key(entity_id: &str, period: impl fmt::Display) -> String {
    format!("{KEY_PREFIX}:{entity_id}:{period}")
}

/// Inverse of [`cache_key`]
#[must_use]
pub fn parse_cache_key(key: &str) -> Option<(String, Period)> {
    let rest = key.strip_prefix(KEY_PREFIX)?.strip_prefix(':')?;
    let (entity, period) = rest.rsplit_once(':')?;
    if entity.is_empty() {
        return None;
    }
    Some((entity.to_string(), period.parse().ok()?))
}

/// Which tier (or upstream) answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServedFrom {
    Durable,
    Local,
    Upstream,
    /// Local entry past its TTL, served because the refetch failed
    Stale,
}

/// Record plus its provenance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServedRecord {
    pub record: AggregatedRecord,
    pub source: ServedFrom,
    pub stale: bool,
}

impl ServedRecord {
    pub(crate) fn new(record: AggregatedRecord, source: ServedFrom) -> Self {
        Self {
            record,
            stale: source == ServedFrom::Stale,
            source,
        }
    }
}

/// Coordinator counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheManagerStats {
    pub requests: u64,
    pub durable_hits: u64,
    pub local_hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub stale_serves: u64,
    pub fetch_errors: u64,
    pub in_flight: usize,
}

/// RAII cleanup guard for in-flight request tracking
/// Ensures that entries are removed from `DashMap` even on early return or panic
struct CleanupGuard<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Multi-tier coordinator over a durable store and the local tier
pub struct CacheManager {
    durable: Arc<dyn CacheStore>,
    local: Arc<MokaCache>,
    orchestrator: Arc<FetchOrchestrator>,
    config: TierConfig,
    requests: AtomicU64,
    durable_hits: AtomicU64,
    local_hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    stale_serves: AtomicU64,
    fetch_errors: AtomicU64,
    /// In-flight fetches, one lock per key
    in_flight_requests: DashMap<String, Arc<Mutex<()>>>,
}

impl CacheManager {
    pub fn new(
        durable: Arc<dyn CacheStore>,
        local: Arc<MokaCache>,
        orchestrator: Arc<FetchOrchestrator>,
        config: TierConfig,
    ) -> Self {
        info!(
            durable = durable.name(),
            local = local.name(),
            ttl_secs = config.ttl.as_secs(),
            stale_multiplier = config.stale_multiplier,
            "Initializing Cache Manager"
        );
        Self {
            durable,
            local,
            orchestrator,
            config,
            requests: AtomicU64::new(0),
            durable_hits: AtomicU64::new(0),
            local_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            stale_serves: AtomicU64::new(0),
            fetch_errors: AtomicU64::new(0),
            in_flight_requests: DashMap::new(),
        }
    }

    /// Aggregated record for one entity and period
    ///
    /// Lookup order: durable tier (promoting hits into the local tier), local
    /// tier, then a coalesced upstream fetch that populates both tiers.
    /// `Period::Latest` is answered under the key of the month it resolves to.
    ///
    /// # Errors
    ///
    /// Returns the orchestrator's error when the fetch fails and no local entry
    /// is inside the stale window, or when `Latest` cannot be resolved.
    pub async fn get_aggregated(&self, entity_id: &str, period: &Period) -> Result<ServedRecord, FetchError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let period = self.resolve_period(period).await?;
        let key = cache_key(entity_id, &period);

        if let Some(served) = self.lookup_cached(&key).await {
            return Ok(served);
        }

        match self.fetch_coalesced(entity_id, &period).await {
            Ok(served) => {
                if served.source == ServedFrom::Upstream {
                    self.put_durable(&key, &served.record).await;
                }
                Ok(served)
            }
            Err(err) => match self.stale_fallback(&key).await {
                Some(served) => Ok(served),
                None => {
                    warn!(key = %key, error = %err, "[Manager] Fetch failed with no stale fallback");
                    Err(err)
                }
            },
        }
    }

    /// Upstream fetch for one pair, coalesced with any other in-flight fetch
    /// of the same key
    ///
    /// Only the first caller reaches upstream; callers that waited on the key
    /// are answered from the tier it populated. A fresh record is written to
    /// the local tier before the key is released. The durable write is left to
    /// the caller so batches can write in bulk.
    ///
    /// # Errors
    ///
    /// Propagates the orchestrator's classified error.
    pub async fn fetch_coalesced(&self, entity_id: &str, period: &Period) -> Result<ServedRecord, FetchError> {
        let key = cache_key(entity_id, period);
        let lock = self
            .in_flight_requests
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;
        let _cleanup_guard = CleanupGuard {
            map: &self.in_flight_requests,
            key: key.clone(),
        };

        // Another request may have populated a tier while we waited
        if let Some(served) = self.lookup_cached(&key).await {
            return Ok(served);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "[Manager] Miss on both tiers, fetching upstream");

        match self.fetch_fresh(entity_id, period).await {
            Ok(record) => {
                if let Some(value) = encode(&key, &record) {
                    self.local.set(&key, value, self.config.ttl).await;
                }
                Ok(ServedRecord::new(record, ServedFrom::Upstream))
            }
            Err(err) => {
                self.fetch_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Months with published data, newest first
    ///
    /// Served from either tier while younger than the dataset TTL; a failed
    /// refetch falls back to a local copy inside the dataset stale window.
    ///
    /// # Errors
    ///
    /// Returns the orchestrator's error when the list is not cached and cannot
    /// be fetched.
    pub async fn available_datasets(&self) -> Result<Vec<DatasetAvailability>, FetchError> {
        if let Some((datasets, source)) = self.lookup_value::<Vec<DatasetAvailability>>(DATASETS_KEY).await {
            debug!(source = ?source, months = datasets.len(), "[Manager] Dataset list served from cache");
            return Ok(datasets);
        }

        match self.orchestrator.fetch_datasets().await {
            Ok(datasets) => {
                if let Ok(value) = serde_json::to_value(&datasets) {
                    if let Err(e) = self.durable.set(DATASETS_KEY, value.clone(), self.config.dataset_ttl).await {
                        warn!(error = %e, "[Manager] Durable write of dataset list failed");
                    }
                    self.local.set(DATASETS_KEY, value, self.config.dataset_ttl).await;
                }
                info!(months = datasets.len(), "[Manager] Refreshed dataset list");
                Ok(datasets)
            }
            Err(err) => {
                let stale = self
                    .local
                    .get_stale(DATASETS_KEY, self.config.dataset_stale_window())
                    .await
                    .and_then(|entry| decode::<Vec<DatasetAvailability>>(DATASETS_KEY, entry.value));
                match stale {
                    Some(datasets) => {
                        warn!(error = %err, "[Manager] Serving stale dataset list");
                        Ok(datasets)
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// Concrete month for `period`; `Latest` becomes the newest published month
    ///
    /// # Errors
    ///
    /// Fails when the dataset list cannot be obtained, or with
    /// [`ErrorKind::NotFound`] when it is empty.
    pub async fn resolve_period(&self, period: &Period) -> Result<Period, FetchError> {
        if *period != Period::Latest {
            return Ok(*period);
        }
        let newest = self
            .available_datasets()
            .await?
            .first()
            .map(|dataset| dataset.period)
            .ok_or_else(|| FetchError::new(ErrorKind::NotFound, "no published stop-and-search months"))?;
        debug!(resolved = %newest, "[Manager] Resolved latest period");
        Ok(newest)
    }

    /// Fetch and aggregate from upstream without touching either tier
    ///
    /// # Errors
    ///
    /// Propagates the orchestrator's classified error.
    pub async fn fetch_fresh(&self, entity_id: &str, period: &Period) -> Result<AggregatedRecord, FetchError> {
        let incidents = self.orchestrator.fetch(entity_id, period).await?;
        let record = aggregate_for(entity_id, &period.to_string(), &incidents);
        info!(entity = %entity_id, period = %period, total = record.total, "[Manager] Aggregated fresh record");
        Ok(record)
    }

    /// Local entry for `key` if it is still inside the stale window
    pub async fn stale_fallback(&self, key: &str) -> Option<ServedRecord> {
        let entry = self.local.get_stale(key, self.config.stale_window()).await?;
        let record = decode(key, entry.value)?;
        self.stale_serves.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, age_secs = entry.age.as_secs(), "[Manager] Serving stale record");
        Some(ServedRecord::new(record, ServedFrom::Stale))
    }

    /// Write a record to both tiers
    ///
    /// The durable write is best-effort; a failure is logged and the local
    /// write still happens.
    pub async fn put_aggregated(&self, record: &AggregatedRecord) {
        let key = record_key(&record.entity_id, &record.period);
        let Some(value) = encode(&key, record) else {
            return;
        };
        if let Err(e) = self.durable.set(&key, value.clone(), self.config.ttl).await {
            warn!(key = %key, error = %e, "[Manager] Durable write failed, continuing with local tier");
        }
        self.local.set(&key, value, self.config.ttl).await;
    }

    async fn put_durable(&self, key: &str, record: &AggregatedRecord) {
        let Some(value) = encode(key, record) else {
            return;
        };
        if let Err(e) = self.durable.set(key, value, self.config.ttl).await {
            warn!(key = %key, error = %e, "[Manager] Durable write failed, local tier still holds the record");
        }
    }

    /// Copy a durable entry into the local tier with its original stamp
    ///
    /// Entries whose store reports no stamp are not promoted.
    pub async fn promote(&self, key: &str, value: Value, meta: Option<EntryMeta>) {
        match meta {
            Some(meta) => {
                self.local.set_stamped(key, value, meta.timestamp, meta.ttl()).await;
                self.promotions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, created_at = meta.timestamp, "[Manager] Durable hit, promoted to local tier");
            }
            None => debug!(key = %key, "[Manager] Durable hit without a stamp, not promoted"),
        }
    }

    /// Drop one entity/period from both tiers
    pub async fn invalidate(&self, entity_id: &str, period: &Period) {
        let key = cache_key(entity_id, period);
        if let Err(e) = self.durable.delete(&key).await {
            warn!(key = %key, error = %e, "[Manager] Durable delete failed");
        }
        self.local.remove(&key).await;
        debug!(key = %key, "[Manager] Invalidated");
    }

    /// Try the durable tier, then the local tier
    async fn lookup_cached(&self, key: &str) -> Option<ServedRecord> {
        let (record, source) = self.lookup_value(key).await?;
        match source {
            ServedFrom::Durable => self.durable_hits.fetch_add(1, Ordering::Relaxed),
            _ => {
                debug!(key = %key, "[Manager] Local hit");
                self.local_hits.fetch_add(1, Ordering::Relaxed)
            }
        };
        Some(ServedRecord::new(record, source))
    }

    async fn lookup_value<T: DeserializeOwned>(&self, key: &str) -> Option<(T, ServedFrom)> {
        if let Some(entry) = self.durable.get_entry(key).await {
            if let Some(decoded) = decode(key, entry.value.clone()) {
                self.promote(key, entry.value, entry.meta).await;
                return Some((decoded, ServedFrom::Durable));
            }
        }

        let value = self.local.get(key).await?;
        let decoded = decode(key, value)?;
        Some((decoded, ServedFrom::Local))
    }

    #[must_use]
    pub fn stats(&self) -> CacheManagerStats {
        CacheManagerStats {
            requests: self.requests.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            local_hits: self.local_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            stale_serves: self.stale_serves.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight_requests.len(),
        }
    }

    #[must_use]
    pub fn durable(&self) -> &Arc<dyn CacheStore> {
        &self.durable
    }

    #[must_use]
    pub fn local(&self) -> &Arc<MokaCache> {
        &self.local
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<FetchOrchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }
}

/// Cached payloads that no longer decode are treated as misses
pub(crate) fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(key = %key, error = %e, "[Manager] Cached payload does not decode");
            None
        }
    }
}

pub(crate) fn encode(key: &str, record: &AggregatedRecord) -> Option<Value> {
    match serde_json::to_value(record) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %key, error = %e, "[Manager] Failed to encode record");
            None
        }
    }
}
