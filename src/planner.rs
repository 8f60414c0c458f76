//! Batch Request Planner
//!
//! Given N entities × M periods, decides which entities are fully served by
//! storage and which need upstream fetches, then drives the fetches in waves
//! of bounded concurrency. Each fetch goes through the coordinator's per-key
//! lock, so a batch and a single lookup of the same pair share one fetch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregation::{AggregatedRecord, OverallRecord, aggregate_overall};
use crate::cache_manager::{CacheManager, ServedFrom, ServedRecord, cache_key, decode, encode};
use crate::config::PlannerConfig;
use crate::error::FetchError;
use crate::traits::EntryMeta;
use crate::upstream::Period;

/// Whether one (entity, period) pair is currently in storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeriodStatus {
    Cached,
    Missing,
}

/// Storage answer for one pair, found while planning
#[derive(Debug, Clone)]
struct CachedPair {
    record: AggregatedRecord,
    source: ServedFrom,
    value: Value,
    meta: Option<EntryMeta>,
}

/// Partition of a request into fully-cached and needs-fetch entities
///
/// An entity is fully cached only if every requested period is.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    /// Deduplicated periods, in request order
    pub periods: Vec<Period>,
    pub status: BTreeMap<String, BTreeMap<Period, PeriodStatus>>,
    /// Deduplicated, in request order
    pub cached_entities: Vec<String>,
    /// Deduplicated, in request order
    pub needs_fetch: Vec<String>,
    hits: HashMap<String, CachedPair>,
}

impl BatchPlan {
    /// Periods of `entity_id` that are not in storage
    #[must_use]
    pub fn missing_periods(&self, entity_id: &str) -> Vec<Period> {
        self.status
            .get(entity_id)
            .map(|periods| {
                periods
                    .iter()
                    .filter(|(_, status)| **status == PeriodStatus::Missing)
                    .map(|(period, _)| *period)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Progress after each wave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub completed_batches: usize,
    pub total_batches: usize,
    pub entities_done: usize,
    pub entities_total: usize,
}

/// A pair that could not be fetched and had no stale fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairFailure {
    pub entity_id: String,
    pub period: Period,
    pub error: FetchError,
}

/// Outcome of [`BatchPlanner::execute`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    /// entity → period → record; failed pairs are absent
    pub grid: BTreeMap<String, BTreeMap<Period, ServedRecord>>,
    /// Entities served entirely from storage
    pub cached: Vec<String>,
    /// Entities that needed at least one upstream fetch
    pub fetched: Vec<String>,
    pub failures: Vec<PairFailure>,
}

impl BatchResult {
    #[must_use]
    pub fn get(&self, entity_id: &str, period: &Period) -> Option<&ServedRecord> {
        self.grid.get(entity_id)?.get(period)
    }

    /// Cross-entity rollup of one period's records
    #[must_use]
    pub fn overall(&self, period: &Period) -> OverallRecord {
        let records: Vec<&AggregatedRecord> = self
            .grid
            .values()
            .filter_map(|row| row.get(period))
            .map(|served| &served.record)
            .collect();
        aggregate_overall(&period.to_string(), records)
    }
}

/// Plans and executes entity × period requests against a [`CacheManager`]
pub struct BatchPlanner {
    manager: Arc<CacheManager>,
    config: PlannerConfig,
}

impl BatchPlanner {
    pub fn new(manager: Arc<CacheManager>, config: PlannerConfig) -> Self {
        Self { manager, config }
    }

    /// Classify every pair with one bulk durable lookup, then the local tier
    pub async fn plan(&self, entities: &[String], periods: &[Period]) -> BatchPlan {
        let entities = dedupe(entities);
        let periods = dedupe(periods);

        let keys: Vec<String> = entities
            .iter()
            .flat_map(|entity| periods.iter().map(move |period| cache_key(entity, period)))
            .collect();
        let bulk = self.manager.durable().get_multiple(&keys).await;
        let mut stamps = bulk.stamps;
        let mut durable = bulk.cached;

        let mut plan = BatchPlan {
            periods: periods.clone(),
            ..BatchPlan::default()
        };
        for entity in &entities {
            let mut statuses = BTreeMap::new();
            for period in &periods {
                let key = cache_key(entity, period);
                let hit = match durable.remove(&key) {
                    Some(value) => decode(&key, value.clone()).map(|record| CachedPair {
                        record,
                        source: ServedFrom::Durable,
                        value,
                        meta: stamps.remove(&key),
                    }),
                    None => None,
                };
                let hit = match hit {
                    Some(hit) => Some(hit),
                    None => self.manager.local().get(&key).await.and_then(|value| {
                        decode(&key, value.clone()).map(|record| CachedPair {
                            record,
                            source: ServedFrom::Local,
                            value,
                            meta: None,
                        })
                    }),
                };

                let status = if let Some(hit) = hit {
                    plan.hits.insert(key, hit);
                    PeriodStatus::Cached
                } else {
                    PeriodStatus::Missing
                };
                statuses.insert(*period, status);
            }

            if statuses.values().all(|s| *s == PeriodStatus::Cached) {
                plan.cached_entities.push(entity.clone());
            } else {
                plan.needs_fetch.push(entity.clone());
            }
            plan.status.insert(entity.clone(), statuses);
        }

        debug!(
            entities = entities.len(),
            periods = periods.len(),
            cached = plan.cached_entities.len(),
            needs_fetch = plan.needs_fetch.len(),
            "[Planner] Plan ready"
        );
        plan
    }

    /// Serve every pair, fetching what storage does not have
    ///
    /// `Period::Latest` is resolved to the newest published month first; if
    /// that fails, every entity reports a failure for `Latest`.
    pub async fn execute(&self, entities: &[String], periods: &[Period]) -> BatchResult {
        self.execute_with_progress(entities, periods, |_| {}).await
    }

    /// [`Self::execute`], reporting progress after each wave
    pub async fn execute_with_progress<F>(&self, entities: &[String], periods: &[Period], mut on_progress: F) -> BatchResult
    where
        F: FnMut(BatchProgress) + Send,
    {
        let mut unresolved = None;
        let mut resolved = Vec::with_capacity(periods.len());
        for period in periods {
            match self.manager.resolve_period(period).await {
                Ok(period) => resolved.push(period),
                Err(error) => {
                    warn!(error = %error, "[Planner] Could not resolve latest period");
                    unresolved = Some(error);
                }
            }
        }

        let mut plan = self.plan(entities, &resolved).await;
        let mut result = BatchResult {
            cached: plan.cached_entities.clone(),
            fetched: plan.needs_fetch.clone(),
            ..BatchResult::default()
        };
        if let Some(error) = unresolved {
            for entity in dedupe(entities) {
                result.failures.push(PairFailure {
                    entity_id: entity,
                    period: Period::Latest,
                    error: error.clone(),
                });
            }
        }

        // Everything storage already has, including cached periods of
        // needs-fetch entities
        for (entity, statuses) in &plan.status {
            for (period, status) in statuses {
                if *status != PeriodStatus::Cached {
                    continue;
                }
                let key = cache_key(entity, period);
                let Some(hit) = plan.hits.remove(&key) else {
                    continue;
                };
                if hit.source == ServedFrom::Durable {
                    self.manager.promote(&key, hit.value, hit.meta).await;
                }
                insert(&mut result, entity, *period, ServedRecord::new(hit.record, hit.source));
            }
        }

        let batch_size = self.config.batch_size.max(1);
        let total_batches = plan.needs_fetch.len().div_ceil(batch_size);
        let mut entities_done = 0;

        for (index, wave) in plan.needs_fetch.chunks(batch_size).enumerate() {
            if index > 0 && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }

            let outcomes = join_all(wave.iter().map(|entity| {
                let missing = plan.missing_periods(entity);
                self.fetch_entity(entity, missing)
            }))
            .await;

            let mut to_store = BTreeMap::new();
            for (entity, fetched) in wave.iter().zip(outcomes) {
                for (period, outcome) in fetched {
                    let key = cache_key(entity, &period);
                    match outcome {
                        Ok(served) => {
                            // a Durable or Local answer means another caller's fetch already stored it
                            if served.source == ServedFrom::Upstream {
                                if let Some(value) = encode(&key, &served.record) {
                                    to_store.insert(key, value);
                                }
                            }
                            insert(&mut result, entity, period, served);
                        }
                        Err(error) => match self.manager.stale_fallback(&key).await {
                            Some(stale) => insert(&mut result, entity, period, stale),
                            None => result.failures.push(PairFailure {
                                entity_id: entity.clone(),
                                period,
                                error,
                            }),
                        },
                    }
                }
            }
            self.store_wave(to_store).await;

            entities_done += wave.len();
            let progress = BatchProgress {
                completed_batches: index + 1,
                total_batches,
                entities_done,
                entities_total: plan.needs_fetch.len(),
            };
            info!(
                batch = progress.completed_batches,
                total_batches,
                entities_done,
                "[Planner] Batch complete"
            );
            on_progress(progress);
        }

        result
    }

    /// Fetch an entity's missing periods one after another
    async fn fetch_entity(&self, entity_id: &str, periods: Vec<Period>) -> Vec<(Period, Result<ServedRecord, FetchError>)> {
        let mut out = Vec::with_capacity(periods.len());
        for period in periods {
            let outcome = self.manager.fetch_coalesced(entity_id, &period).await;
            out.push((period, outcome));
        }
        out
    }

    /// One bulk durable write per wave; the local tier was written per fetch
    async fn store_wave(&self, entries: BTreeMap<String, Value>) {
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        if let Err(e) = self.manager.durable().set_multiple(entries, self.manager.ttl()).await {
            warn!(count, error = %e, "[Planner] Durable bulk write failed, records remain in the local tier");
        }
    }
}

fn insert(result: &mut BatchResult, entity: &str, period: Period, served: ServedRecord) {
    result
        .grid
        .entry(entity.to_string())
        .or_default()
        .insert(period, served);
}

/// Drop repeats, keeping first occurrences in order
fn dedupe<T: Clone + Eq + Hash>(items: &[T]) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|item| seen.insert((*item).clone()))
        .cloned()
        .collect()
}
