//! Remote Store - Durable Tier over HTTP
//!
//! Client of the `/api/cache` wire protocol served by [`crate::server`], so
//! the durable tier can live in another process. Every action is sent as a
//! POST with a JSON body.
//!
//! Lookups never fail: transport errors degrade to misses.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::clock::duration_millis;
use crate::error::StoreError;
use crate::traits::{BulkGet, CacheStore, EntryMeta, StoreStats, StoredEntry};

#[derive(Debug, Deserialize)]
struct GetResponse {
    cached: bool,
    #[serde(default)]
    data: Value,
    timestamp: Option<u64>,
    ttl: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetResponse {
    #[serde(default)]
    cache_size: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// HTTP client for a remote cache server
#[derive(Debug, Clone)]
pub struct RemoteStore {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteStore {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:8080`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build remote store HTTP client")?;
        let endpoint = format!("{}/api/cache", base_url.trim_end_matches('/'));
        info!(endpoint = %endpoint, "Remote store initialized");
        Ok(Self { client, endpoint })
    }

    async fn call<T: DeserializeOwned>(&self, body: Value) -> Result<T, StoreError> {
        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<ErrorResponse>().await {
                Ok(err) => err.error,
                Err(_) => status.to_string(),
            };
            return Err(StoreError::Remote(format!("{status}: {detail}")));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl CacheStore for RemoteStore {
    async fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    async fn get_entry(&self, key: &str) -> Option<StoredEntry> {
        match self.call::<GetResponse>(json!({"action": "get", "key": key})).await {
            Ok(resp) if resp.cached => {
                let meta = match (resp.timestamp, resp.ttl) {
                    (Some(timestamp), Some(ttl)) => Some(EntryMeta { timestamp, ttl }),
                    _ => None,
                };
                Some(StoredEntry { value: resp.data, meta })
            }
            Ok(_) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "[Remote] Get failed, treating as miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<usize, StoreError> {
        let body = json!({
            "action": "set",
            "key": key,
            "data": serde_json::to_string(&value)?,
            "ttl": duration_millis(ttl),
        });
        let resp: SetResponse = self.call(body).await?;
        debug!(key = %key, ttl_secs = %ttl.as_secs(), "[Remote] Cached key with TTL");
        Ok(resp.cache_size)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.call::<Value>(json!({"action": "delete", "key": key})).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.call::<Value>(json!({"action": "clear"})).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.call(json!({"action": "stats"})).await
    }

    async fn get_multiple(&self, keys: &[String]) -> BulkGet {
        if keys.is_empty() {
            return BulkGet::default();
        }
        match self.call::<BulkGet>(json!({"action": "getMultiple", "keys": keys})).await {
            Ok(result) => result,
            Err(e) => {
                warn!(requested = keys.len(), error = %e, "[Remote] Bulk get failed, treating all as missing");
                BulkGet::all_missing(keys)
            }
        }
    }

    async fn set_multiple(&self, entries: BTreeMap<String, Value>, ttl: Duration) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let count = entries.len();
        let body = json!({
            "action": "setMultiple",
            "data": entries,
            "ttl": duration_millis(ttl),
        });
        self.call::<Value>(body).await?;
        debug!(count, ttl_secs = %ttl.as_secs(), "[Remote] Cached keys in bulk");
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.stats().await.is_ok()
    }

    fn name(&self) -> &'static str {
        "Remote"
    }
}
