//! Integration tests for the multi-tier coordinator
//!
//! Tests tier lookup order, promotion, request coalescing, stale fallback and
//! resolution of the latest period.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use serde_json::Value;
use stopsearch_cache::{
    BulkGet, CacheStore, DATASETS_KEY, ErrorKind, Period, ServedFrom, StoreError, StoreStats, async_trait,
    cache_key,
};
use tokio::task::JoinSet;

/// Durable tier that is down: every read misses, every write fails
struct UnavailableStore;

#[async_trait]
impl CacheStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Option<Value> {
        None
    }

    async fn set(&self, _key: &str, _value: Value, _ttl: Duration) -> Result<usize, StoreError> {
        Err(StoreError::Remote("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Remote("connection refused".to_string()))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        Err(StoreError::Remote("connection refused".to_string()))
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Err(StoreError::Remote("connection refused".to_string()))
    }

    async fn get_multiple(&self, keys: &[String]) -> BulkGet {
        BulkGet::all_missing(keys)
    }

    async fn set_multiple(&self, _entries: BTreeMap<String, Value>, _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Remote("connection refused".to_string()))
    }

    async fn health_check(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "Unavailable"
    }
}

#[tokio::test]
async fn test_miss_populates_both_tiers() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, _, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();

    let served = manager
        .get_aggregated("kent", &may())
        .await
        .unwrap_or_else(|e| panic!("fetch failed: {e}"));

    assert_eq!(served.source, ServedFrom::Upstream);
    assert!(!served.stale);
    assert_eq!(served.record.entity_id, "kent");
    assert_eq!(served.record.period, "2024-05");
    assert_eq!(served.record.total, 5);
    assert_eq!(source.calls(), 1);

    let key = cache_key("kent", &may());
    assert!(system.durable.get(&key).await.is_some(), "durable tier not written");
    assert!(system.local.get(&key).await.is_some(), "local tier not written");
}

#[tokio::test]
async fn test_second_request_hits_durable_tier() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, _, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();

    let first = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));
    let second = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(second.source, ServedFrom::Durable);
    assert_eq!(second.record, first.record);
    assert_eq!(source.calls(), 1);

    let stats = manager.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.durable_hits, 1);
    assert_eq!(stats.promotions, 1);
}

#[tokio::test]
async fn test_local_tier_serves_when_durable_entry_is_gone() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, _, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();
    manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    system
        .durable
        .delete(&cache_key("kent", &may()))
        .await
        .unwrap_or_else(|e| panic!("{e}"));

    let served = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(served.source, ServedFrom::Local);
    assert_eq!(source.calls(), 1);
    assert_eq!(manager.stats().local_hits, 1);
}

#[tokio::test]
async fn test_concurrent_requests_coalesce_into_one_fetch() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let source = ScriptedSource::with_latency(Duration::from_millis(50));
    let (system, _, source) = setup_system_with_source(test_config(&dir), source).await;

    let mut tasks = JoinSet::new();
    for _ in 0..10 {
        let manager = Arc::clone(system.cache_manager());
        tasks.spawn(async move { manager.get_aggregated("kent", &may()).await });
    }

    let mut totals = Vec::new();
    while let Some(result) = tasks.join_next().await {
        let served = result
            .unwrap_or_else(|_| panic!("Task panicked"))
            .unwrap_or_else(|e| panic!("fetch failed: {e}"));
        totals.push(served.record.total);
    }

    assert_eq!(totals, vec![5; 10]);
    assert_eq!(source.calls(), 1, "stampede reached upstream more than once");
    assert_eq!(system.cache_manager().stats().in_flight, 0, "in-flight entry leaked");
}

#[tokio::test]
async fn test_distinct_keys_are_not_serialized_together() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, _, source) = setup_system(test_config(&dir)).await;

    let mut tasks = JoinSet::new();
    for entity in entities(4) {
        let manager = Arc::clone(system.cache_manager());
        tasks.spawn(async move { manager.get_aggregated(&entity, &may()).await });
    }
    while let Some(result) = tasks.join_next().await {
        result
            .unwrap_or_else(|_| panic!("Task panicked"))
            .unwrap_or_else(|e| panic!("{e}"));
    }

    assert_eq!(source.calls(), 4);
    assert_eq!(source.entities_called().len(), 4);
}

#[tokio::test]
async fn test_stale_record_served_when_upstream_fails() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, clock, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();
    let original = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    // past the TTL, inside ttl * 3
    clock.advance(Duration::from_secs(2 * 3600));
    source.fail("kent", ErrorKind::UpstreamUnavailable);

    let served = manager
        .get_aggregated("kent", &may())
        .await
        .unwrap_or_else(|e| panic!("expected stale fallback, got {e}"));

    assert_eq!(served.source, ServedFrom::Stale);
    assert!(served.stale);
    assert_eq!(served.record, original.record);
    assert_eq!(manager.stats().stale_serves, 1);
    assert_eq!(manager.stats().fetch_errors, 1);
}

#[tokio::test]
async fn test_error_when_beyond_stale_window() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, clock, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();
    manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    clock.advance(Duration::from_secs(3 * 3600 + 1));
    source.fail("kent", ErrorKind::UpstreamUnavailable);

    let err = manager
        .get_aggregated("kent", &may())
        .await
        .err()
        .unwrap_or_else(|| panic!("expected an error beyond the stale window"));
    assert_eq!(err.kind, ErrorKind::UpstreamUnavailable);
}

#[tokio::test]
async fn test_fresh_fetch_after_ttl_replaces_entry() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, clock, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();
    manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    clock.advance(Duration::from_secs(3601));
    let served = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(served.source, ServedFrom::Upstream);
    assert_eq!(source.calls_for("kent", &may()), 2);
}

#[tokio::test]
async fn test_not_found_is_not_retried_and_surfaces() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, _, source) = setup_system(test_config(&dir)).await;
    source.fail("atlantis", ErrorKind::NotFound);

    let err = system
        .cache_manager()
        .get_aggregated("atlantis", &may())
        .await
        .err()
        .unwrap_or_else(|| panic!("expected NotFound"));

    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(err.status, Some(404));
    assert_eq!(source.calls(), 1);
    assert_eq!(system.orchestrator().recent_errors().len(), 1);
}

#[tokio::test]
async fn test_rate_limited_exhausts_bounded_retries() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, _, source) = setup_system(test_config(&dir)).await;
    source.fail("kent", ErrorKind::RateLimited);

    let err = system
        .cache_manager()
        .get_aggregated("kent", &may())
        .await
        .err()
        .unwrap_or_else(|| panic!("expected RateLimited"));

    assert_eq!(err.kind, ErrorKind::RateLimited);
    // initial attempt plus max_retries
    assert_eq!(source.calls(), 3);
    assert_eq!(system.orchestrator().stats().retries, 2);
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, _, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();
    manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    manager.invalidate("kent", &may()).await;
    let served = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(served.source, ServedFrom::Upstream);
    assert_eq!(source.calls(), 2);
}

#[tokio::test]
async fn test_unavailable_durable_tier_is_tolerated() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let source = ScriptedSource::new();
    let clock = Arc::new(stopsearch_cache::ManualClock::new(CLOCK_START));
    let system = stopsearch_cache::CacheSystemBuilder::new()
        .with_config(test_config(&dir))
        .with_durable(Arc::new(UnavailableStore))
        .with_source(source.clone())
        .with_clock(clock)
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build cache system: {e}"));
    let manager = system.cache_manager();

    let first = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));
    let second = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(first.source, ServedFrom::Upstream);
    assert_eq!(second.source, ServedFrom::Local);
    assert_eq!(source.calls(), 1);
    assert!(system.health_check().await, "local tier alone keeps the system healthy");
}

#[tokio::test]
async fn test_promotion_keeps_the_durable_entry_age() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, clock, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();
    manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    // drop the local copy so the next read promotes from the durable tier
    system.local.remove(&cache_key("kent", &may())).await;
    clock.advance(Duration::from_millis(3_600_000 - 1));
    let promoted = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(promoted.source, ServedFrom::Durable);
    assert_eq!(manager.stats().promotions, 1);

    clock.advance(Duration::from_secs(30 * 60));
    let served = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(served.source, ServedFrom::Upstream, "expired record served from the local tier");
    assert_eq!(source.calls_for("kent", &may()), 2);
}

#[tokio::test]
async fn test_promoted_entry_stale_window_counts_from_creation() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, clock, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();
    manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    system.local.remove(&cache_key("kent", &may())).await;
    clock.advance(Duration::from_millis(3_600_000 - 1));
    manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    // three TTLs after creation, well inside three TTLs after promotion
    clock.advance(Duration::from_secs(2 * 3600 + 1));
    source.fail("kent", ErrorKind::UpstreamUnavailable);

    let err = manager
        .get_aggregated("kent", &may())
        .await
        .err()
        .unwrap_or_else(|| panic!("promotion extended the stale window"));
    assert_eq!(err.kind, ErrorKind::UpstreamUnavailable);
}

#[tokio::test]
async fn test_latest_resolves_to_newest_published_month() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, _, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();

    let latest = manager
        .get_aggregated("kent", &Period::Latest)
        .await
        .unwrap_or_else(|e| panic!("{e}"));
    let may_record = manager.get_aggregated("kent", &may()).await.unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(latest.record.period, "2024-05");
    assert_eq!(may_record.source, ServedFrom::Durable);
    assert_eq!(source.calls(), 1);
    assert_eq!(source.calls_for("kent", &Period::Latest), 0);
    assert!(system.durable.get("aggregated:kent:latest").await.is_none());
    assert!(system.durable.get(DATASETS_KEY).await.is_some());
}

#[tokio::test]
async fn test_dataset_list_is_cached_for_its_own_ttl() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, clock, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();

    for entity in ["kent", "essex", "kent"] {
        manager.get_aggregated(entity, &Period::Latest).await.unwrap_or_else(|e| panic!("{e}"));
    }
    assert_eq!(source.dataset_calls(), 1);

    // past the record TTL, inside the 24h dataset TTL
    clock.advance(Duration::from_secs(2 * 3600));
    manager.get_aggregated("kent", &Period::Latest).await.unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(source.dataset_calls(), 1);

    clock.advance(Duration::from_secs(24 * 3600));
    source.publish(vec![stopsearch_cache::DatasetAvailability {
        period: Period::Month { year: 2024, month: 6 },
        entities: vec!["kent".to_string()],
    }]);
    let june = manager.get_aggregated("kent", &Period::Latest).await.unwrap_or_else(|e| panic!("{e}"));

    assert_eq!(source.dataset_calls(), 2);
    assert_eq!(june.record.period, "2024-06");
}

#[tokio::test]
async fn test_stale_dataset_list_resolves_latest_when_refresh_fails() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, clock, source) = setup_system(test_config(&dir)).await;
    let manager = system.cache_manager();
    manager.get_aggregated("kent", &Period::Latest).await.unwrap_or_else(|e| panic!("{e}"));

    clock.advance(Duration::from_secs(25 * 3600));
    source.fail_datasets(Some(ErrorKind::UpstreamUnavailable));

    let served = manager
        .get_aggregated("kent", &Period::Latest)
        .await
        .unwrap_or_else(|e| panic!("stale dataset list not used: {e}"));
    assert_eq!(served.record.period, "2024-05");
    assert_eq!(source.dataset_calls(), 2);
}

#[tokio::test]
async fn test_latest_fails_without_published_months() {
    let dir = tempfile::tempdir().unwrap_or_else(|_| panic!("tempdir"));
    let (system, _, source) = setup_system(test_config(&dir)).await;
    source.publish(Vec::new());

    let err = system
        .cache_manager()
        .get_aggregated("kent", &Period::Latest)
        .await
        .err()
        .unwrap_or_else(|| panic!("expected NotFound"));

    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(source.calls(), 0);
}
