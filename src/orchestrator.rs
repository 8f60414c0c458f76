//! Fetch Orchestrator
//!
//! Every upstream call goes through [`FetchOrchestrator::fetch`] or
//! [`FetchOrchestrator::fetch_datasets`], which layer:
//!
//! - **Spacing**: callers reserve send slots at least `min_interval` apart
//! - **Retry**: only `RateLimited` is retried, with exponential backoff + jitter
//! - **Circuit breaker**: after `breaker_threshold` consecutive failures each
//!   attempt waits `min(failures * breaker_step, breaker_cap)` first
//! - **Error log**: a bounded ring buffer of the most recent classified errors
//!
//! State is owned by the instance; two orchestrators never share spacing or
//! breaker state.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::aggregation::RawIncident;
use crate::config::FetchConfig;
use crate::error::{ErrorKind, FetchError};
use crate::upstream::{DatasetAvailability, IncidentSource, Period};

/// Entity label of dataset-availability calls in the error log
const DATASETS_LABEL: &str = "datasets";

/// One entry of the recent-errors ring buffer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub entity_id: String,
    pub period: String,
    pub at: DateTime<Utc>,
}

/// Orchestrator counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    /// Attempts sent to the source, retries included
    pub calls: u64,
    pub retries: u64,
    /// Failed attempts, `InvalidResponse` included
    pub failures: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct FetchState {
    consecutive_failures: u32,
    /// Send time reserved by the most recent attempt
    last_call: Option<Instant>,
}

/// Governs calls to an [`IncidentSource`]
pub struct FetchOrchestrator {
    source: Arc<dyn IncidentSource>,
    config: FetchConfig,
    state: Mutex<FetchState>,
    errors: Mutex<VecDeque<ErrorRecord>>,
    calls: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl FetchOrchestrator {
    pub fn new(source: Arc<dyn IncidentSource>, config: FetchConfig) -> Self {
        let capacity = config.error_log_capacity;
        Self {
            source,
            config,
            state: Mutex::new(FetchState::default()),
            errors: Mutex::new(VecDeque::with_capacity(capacity)),
            calls: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Fetch raw incidents for one entity and period
    ///
    /// `InvalidResponse` is logged and degraded to an empty batch.
    ///
    /// # Errors
    ///
    /// Returns the classified error of the last attempt once retries are
    /// exhausted, or immediately for non-retryable kinds.
    pub async fn fetch(&self, entity_id: &str, period: &Period) -> Result<Vec<RawIncident>, FetchError> {
        let label = period.to_string();
        let outcome = self
            .call_with_policy(entity_id, &label, || self.source.fetch_incidents(entity_id, period))
            .await;
        match outcome {
            Err(err) if err.kind == ErrorKind::InvalidResponse => {
                warn!(entity = %entity_id, period = %period, error = %err, "[Fetch] Invalid upstream payload, treating as empty");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Published datasets, newest first, under the same spacing, retry and
    /// breaker policy as incident fetches
    ///
    /// # Errors
    ///
    /// Returns the classified error of the last attempt, `InvalidResponse`
    /// included.
    pub async fn fetch_datasets(&self) -> Result<Vec<DatasetAvailability>, FetchError> {
        self.call_with_policy(DATASETS_LABEL, "all", || self.source.available_datasets())
            .await
    }

    async fn call_with_policy<T, F, Fut>(&self, entity_id: &str, period: &str, mut call: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.wait_for_slot().await;
            self.calls.fetch_add(1, Ordering::Relaxed);

            match call().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(err) if err.kind == ErrorKind::InvalidResponse => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    self.push_error(&err, entity_id, period);
                    self.record_success();
                    return Err(err);
                }
                Err(err) => {
                    let failures = self.record_failure(&err, entity_id, period);
                    if err.kind.is_retryable() && attempt < self.config.max_retries {
                        let delay = self.backoff_delay(attempt);
                        self.retries.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            entity = %entity_id,
                            period = %period,
                            attempt = attempt + 1,
                            delay_ms = %delay.as_millis(),
                            "[Fetch] Rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    debug!(entity = %entity_id, period = %period, kind = %err.kind, failures, "[Fetch] Giving up");
                    return Err(err);
                }
            }
        }
    }

    /// Most recent classified errors, oldest first
    #[must_use]
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    #[must_use]
    pub fn stats(&self) -> FetchStats {
        FetchStats {
            calls: self.calls.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
        }
    }

    /// Extra delay imposed by the breaker at the current failure count
    #[must_use]
    pub fn breaker_delay(&self) -> Duration {
        let failures = self.consecutive_failures();
        if failures <= self.config.breaker_threshold {
            return Duration::ZERO;
        }
        self.config
            .breaker_step
            .saturating_mul(failures)
            .min(self.config.breaker_cap)
    }

    /// Breaker delay, then sleep until the reserved send slot
    async fn wait_for_slot(&self) {
        let breaker = self.breaker_delay();
        if !breaker.is_zero() {
            warn!(delay_ms = %breaker.as_millis(), "[Fetch] Circuit breaker active");
            tokio::time::sleep(breaker).await;
        }

        let slot = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let slot = state
                .last_call
                .map_or(now, |last| now.max(last + self.config.min_interval));
            state.last_call = Some(slot);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_add(1)).unwrap_or(i32::MAX);
        let factor = self.config.backoff_base.powi(exponent);
        let base = Duration::try_from_secs_f64(self.config.backoff_unit.as_secs_f64() * factor)
            .unwrap_or(self.config.breaker_cap);
        let jitter_ms = crate::clock::duration_millis(self.config.max_jitter);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..jitter_ms)
        };
        base.saturating_add(Duration::from_millis(jitter))
    }

    fn record_success(&self) {
        self.state.lock().consecutive_failures = 0;
    }

    fn record_failure(&self, err: &FetchError, entity_id: &str, period: &str) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.push_error(err, entity_id, period);
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.consecutive_failures
    }

    fn push_error(&self, err: &FetchError, entity_id: &str, period: &str) {
        let capacity = self.config.error_log_capacity;
        if capacity == 0 {
            return;
        }
        let mut errors = self.errors.lock();
        while errors.len() >= capacity {
            errors.pop_front();
        }
        errors.push_back(ErrorRecord {
            kind: err.kind,
            message: err.message.clone(),
            status: err.status,
            entity_id: entity_id.to_string(),
            period: period.to_string(),
            at: Utc::now(),
        });
    }
}
