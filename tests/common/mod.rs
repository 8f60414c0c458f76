//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - A scripted upstream source with call counters and a published-months list
//! - Temp-dir backed cache systems on a manual clock
//! - Incident generators

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use stopsearch_cache::{
    CacheSystem, CacheSystemBuilder, Config, DatasetAvailability, ErrorKind, FetchError,
    IncidentSource, ManualClock, Period, RawIncident, async_trait,
};
use tempfile::TempDir;

/// Start of every manual clock: 2024-06-01T00:00:00Z
pub const CLOCK_START: u64 = 1_717_200_000_000;

/// Upstream fake: answers every request with generated incidents unless the
/// entity was told to fail
#[derive(Default)]
pub struct ScriptedSource {
    calls: AtomicU32,
    per_key: Mutex<HashMap<String, u32>>,
    failing: Mutex<HashMap<String, ErrorKind>>,
    datasets: Mutex<Vec<DatasetAvailability>>,
    datasets_failing: Mutex<Option<ErrorKind>>,
    dataset_calls: AtomicU32,
    /// Incidents per response
    pub batch_len: usize,
    /// Simulated network latency
    pub latency: Duration,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            batch_len: 5,
            datasets: Mutex::new(published_months()),
            ..Self::default()
        })
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            batch_len: 5,
            latency,
            datasets: Mutex::new(published_months()),
            ..Self::default()
        })
    }

    /// Replace the published-months list
    pub fn publish(&self, datasets: Vec<DatasetAvailability>) {
        *self.datasets.lock() = datasets;
    }

    /// Make the published-months lookup fail with `kind`; `None` restores it
    pub fn fail_datasets(&self, kind: Option<ErrorKind>) {
        *self.datasets_failing.lock() = kind;
    }

    pub fn dataset_calls(&self) -> u32 {
        self.dataset_calls.load(Ordering::SeqCst)
    }

    /// Make every fetch for `entity` fail with `kind`
    pub fn fail(&self, entity: &str, kind: ErrorKind) {
        self.failing.lock().insert(entity.to_string(), kind);
    }

    pub fn recover(&self, entity: &str) {
        self.failing.lock().remove(entity);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, entity: &str, period: &Period) -> u32 {
        self.per_key
            .lock()
            .get(&format!("{entity}:{period}"))
            .copied()
            .unwrap_or(0)
    }

    /// Entities that reached the source at least once
    pub fn entities_called(&self) -> HashSet<String> {
        self.per_key
            .lock()
            .keys()
            .filter_map(|k| k.split_once(':').map(|(e, _)| e.to_string()))
            .collect()
    }
}

#[async_trait]
impl IncidentSource for ScriptedSource {
    async fn fetch_incidents(&self, entity_id: &str, period: &Period) -> Result<Vec<RawIncident>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_key
            .lock()
            .entry(format!("{entity_id}:{period}"))
            .or_insert(0) += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let failing = self.failing.lock().get(entity_id).copied();
        match failing {
            Some(ErrorKind::RateLimited) => Err(FetchError::from_status(429, "Too Many Requests")),
            Some(ErrorKind::NotFound) => Err(FetchError::from_status(404, "Not Found")),
            Some(kind) => Err(FetchError::new(kind, "scripted failure")),
            None => Ok(incidents(self.batch_len)),
        }
    }

    async fn available_datasets(&self) -> Result<Vec<DatasetAvailability>, FetchError> {
        self.dataset_calls.fetch_add(1, Ordering::SeqCst);
        let failing = *self.datasets_failing.lock();
        match failing {
            Some(kind) => Err(FetchError::new(kind, "scripted dataset failure")),
            None => Ok(self.datasets.lock().clone()),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// May and April 2024, newest first
pub fn published_months() -> Vec<DatasetAvailability> {
    [5, 4]
        .into_iter()
        .map(|month| DatasetAvailability {
            period: Period::Month { year: 2024, month },
            entities: vec!["kent".to_string(), "essex".to_string()],
        })
        .collect()
}

/// Config for tests: temp snapshot, no spacing, no jitter, short delays
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.store.snapshot_path = dir.path().join("server-cache.json");
    config.fetch.min_interval = Duration::ZERO;
    config.fetch.max_jitter = Duration::ZERO;
    config.fetch.backoff_unit = Duration::from_millis(1);
    config.fetch.breaker_step = Duration::from_millis(1);
    config.tier.ttl = Duration::from_secs(3600);
    config.planner.batch_delay = Duration::from_millis(20);
    config
}

/// Cache system over a temp-dir snapshot, a manual clock and a scripted source
pub async fn setup_system(config: Config) -> (CacheSystem, Arc<ManualClock>, Arc<ScriptedSource>) {
    setup_system_with_source(config, ScriptedSource::new()).await
}

pub async fn setup_system_with_source(
    config: Config,
    source: Arc<ScriptedSource>,
) -> (CacheSystem, Arc<ManualClock>, Arc<ScriptedSource>) {
    let clock = Arc::new(ManualClock::new(CLOCK_START));
    let system = CacheSystemBuilder::new()
        .with_config(config)
        .with_source(source.clone())
        .with_clock(clock.clone())
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build cache system: {e}"));
    (system, clock, source)
}

pub fn may() -> Period {
    Period::Month { year: 2024, month: 5 }
}

pub fn periods(months: &[u8]) -> Vec<Period> {
    months
        .iter()
        .map(|&month| Period::Month { year: 2024, month })
        .collect()
}

pub fn entities(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("force-{i}")).collect()
}

/// `n` incidents cycling through outcomes, ethnicities and locations
pub fn incidents(n: usize) -> Vec<RawIncident> {
    const OUTCOMES: [&str; 4] = [
        "Arrest",
        "A no further action disposal",
        "Khat or Cannabis warning",
        "Community resolution",
    ];
    const ETHNICITIES: [&str; 3] = ["White", "Black", "Asian"];

    (0..n)
        .map(|i| {
            serde_json::from_value(json!({
                "outcome": OUTCOMES[i % OUTCOMES.len()],
                "officer_defined_ethnicity": ETHNICITIES[i % ETHNICITIES.len()],
                "gender": if i % 2 == 0 { "Male" } else { "Female" },
                "age_range": "18-24",
                "object_of_search": if i % 3 == 0 { "Controlled drugs" } else { "Offensive weapons" },
                "type": "Person search",
                "datetime": format!("2024-05-{:02}T{:02}:15:00+00:00", 1 + i % 28, i % 24),
                "location": {
                    "latitude": format!("{:.4}", 51.5 + (i % 4) as f64 * 0.01),
                    "longitude": "-0.1200"
                }
            }))
            .unwrap_or_else(|e| panic!("bad incident fixture: {e}"))
        })
        .collect()
}

/// Collect grid keys as `entity:period` strings
pub fn grid_pairs<V>(grid: &BTreeMap<String, BTreeMap<Period, V>>) -> Vec<String> {
    grid.iter()
        .flat_map(|(entity, row)| row.keys().map(move |period| format!("{entity}:{period}")))
        .collect()
}
