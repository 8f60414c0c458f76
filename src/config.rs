//! Configuration
//!
//! Every component takes a plain config struct with sensible defaults.
//! [`Config::from_env`] assembles the full set from an optional JSON file
//! (`STOPSEARCH_CONFIG`) overlaid with `STOPSEARCH_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default TTL for cache entries: 90 days, in milliseconds
pub const DEFAULT_TTL_MILLIS: u64 = 7_776_000_000;

/// Durable snapshot store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Snapshot file location
    pub snapshot_path: PathBuf,
    /// Advisory capacity reported by `stats`
    pub max_size: usize,
    /// TTL applied when a writer does not supply one
    #[serde(with = "millis")]
    pub default_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("data/server-cache.json"),
            max_size: 2000,
            default_ttl: Duration::from_millis(DEFAULT_TTL_MILLIS),
        }
    }
}

/// In-process (local) tier settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCacheConfig {
    /// Max number of entries held in memory
    pub max_capacity: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self { max_capacity: 2000 }
    }
}

/// Upstream fetch policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Base URL of the incident API (no trailing slash)
    pub base_url: String,
    pub user_agent: String,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    /// Minimum gap between two outbound calls
    #[serde(with = "millis")]
    pub min_interval: Duration,
    /// Retries after the first rate-limited attempt
    pub max_retries: u32,
    /// Backoff delay is `backoff_base^(attempt+1) * backoff_unit`
    pub backoff_base: f64,
    #[serde(with = "millis")]
    pub backoff_unit: Duration,
    /// Upper bound (exclusive) of the random jitter added to each backoff
    #[serde(with = "millis")]
    pub max_jitter: Duration,
    /// Breaker engages once consecutive failures exceed this
    pub breaker_threshold: u32,
    #[serde(with = "millis")]
    pub breaker_step: Duration,
    #[serde(with = "millis")]
    pub breaker_cap: Duration,
    /// Capacity of the recent-errors ring buffer
    pub error_log_capacity: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.police.uk/api".to_string(),
            user_agent: concat!("stopsearch-cache/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(30),
            min_interval: Duration::from_millis(500),
            max_retries: 2,
            backoff_base: 3.0,
            backoff_unit: Duration::from_secs(1),
            max_jitter: Duration::from_secs(2),
            breaker_threshold: 5,
            breaker_step: Duration::from_secs(2),
            breaker_cap: Duration::from_secs(30),
            error_log_capacity: 10,
        }
    }
}

/// Freshness policy shared by both tiers
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    #[serde(with = "millis")]
    pub ttl: Duration,
    /// Local entries younger than `ttl * stale_multiplier` may be served
    /// stale when a fetch fails
    pub stale_multiplier: u32,
    /// Lifetime of the cached dataset-availability list
    #[serde(with = "millis")]
    pub dataset_ttl: Duration,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(DEFAULT_TTL_MILLIS),
            stale_multiplier: 3,
            dataset_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl TierConfig {
    /// Oldest age at which a stale entry may still be served
    #[must_use]
    pub fn stale_window(&self) -> Duration {
        self.ttl.saturating_mul(self.stale_multiplier)
    }

    /// Stale window of the dataset-availability list
    #[must_use]
    pub fn dataset_stale_window(&self) -> Duration {
        self.dataset_ttl.saturating_mul(self.stale_multiplier)
    }
}

/// Batch planner settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Entities fetched concurrently per wave
    pub batch_size: usize,
    /// Pause between waves
    #[serde(with = "millis")]
    pub batch_delay: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            batch_delay: Duration::from_millis(200),
        }
    }
}

/// Cache server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub local: LocalCacheConfig,
    pub fetch: FetchConfig,
    pub tier: TierConfig,
    pub planner: PlannerConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load a JSON config file; absent sections keep their defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Defaults (or `STOPSEARCH_CONFIG` file) overlaid with environment variables
    ///
    /// | variable | field |
    /// |---|---|
    /// | `STOPSEARCH_SNAPSHOT_PATH` | `store.snapshot_path` |
    /// | `STOPSEARCH_UPSTREAM_URL` | `fetch.base_url` |
    /// | `STOPSEARCH_MIN_INTERVAL_MS` | `fetch.min_interval` |
    /// | `STOPSEARCH_TTL_MS` | `tier.ttl` and `store.default_ttl` |
    /// | `STOPSEARCH_STALE_MULTIPLIER` | `tier.stale_multiplier` |
    /// | `STOPSEARCH_DATASET_TTL_MS` | `tier.dataset_ttl` |
    /// | `STOPSEARCH_BIND_ADDR` | `server.bind_addr` |
    ///
    /// # Errors
    ///
    /// Returns an error if the config file is unreadable or a variable does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("STOPSEARCH_CONFIG") {
            Ok(path) => Self::from_json_file(path)?,
            Err(_) => Self::default(),
        };

        if let Ok(path) = std::env::var("STOPSEARCH_SNAPSHOT_PATH") {
            config.store.snapshot_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("STOPSEARCH_UPSTREAM_URL") {
            config.fetch.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ms) = env_parse::<u64>("STOPSEARCH_MIN_INTERVAL_MS")? {
            config.fetch.min_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("STOPSEARCH_TTL_MS")? {
            config.tier.ttl = Duration::from_millis(ms);
            config.store.default_ttl = Duration::from_millis(ms);
        }
        if let Some(multiplier) = env_parse::<u32>("STOPSEARCH_STALE_MULTIPLIER")? {
            config.tier.stale_multiplier = multiplier;
        }
        if let Some(ms) = env_parse::<u64>("STOPSEARCH_DATASET_TTL_MS")? {
            config.tier.dataset_ttl = Duration::from_millis(ms);
        }
        if let Ok(addr) = std::env::var("STOPSEARCH_BIND_ADDR") {
            config.server.bind_addr = addr;
        }

        Ok(config)
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {name}: {raw}")),
        Err(_) => Ok(None),
    }
}

/// Durations as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(crate::clock::duration_millis(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
