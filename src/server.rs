//! Cache server
//!
//! Exposes a [`CacheStore`] over HTTP on a single endpoint, `/api/cache`.
//! Parameters come from the query string (GET) or a JSON object body (POST);
//! `action` selects the operation. `/health` reports store health.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::cache_manager::record_key;
use crate::error::StoreError;
use crate::traits::CacheStore;

const VALID_ACTIONS: &str = "get, set, delete, clear, stats, getMultiple, setMultiple, getForceData";

/// Shared handler state
#[derive(Clone)]
pub struct ServerState {
    store: Arc<dyn CacheStore>,
    default_ttl: Duration,
}

/// Handler failure, rendered as `{error}`
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(e) => {
                error!(error = %e, "[Server] Store operation failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

/// Request parameters from either transport
struct Params(HashMap<String, Value>);

impl Params {
    fn text(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn required_text(&self, name: &str, action: &str) -> Result<String, ApiError> {
        self.text(name)
            .ok_or_else(|| ApiError::BadRequest(format!("{name} is required for {action} action")))
    }

    /// Parameter holding JSON: either an embedded JSON string or a raw value
    fn json(&self, name: &str) -> Result<Option<Value>, ApiError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => serde_json::from_str(s)
                .map(Some)
                .map_err(|e| ApiError::BadRequest(format!("Invalid JSON in {name}: {e}"))),
            Some(other) => Ok(Some(other.clone())),
        }
    }

    fn ttl(&self, default: Duration) -> Result<Duration, ApiError> {
        let millis = match self.0.get("ttl") {
            None | Some(Value::Null) => return Ok(default),
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(_) => None,
        };
        millis
            .map(Duration::from_millis)
            .ok_or_else(|| ApiError::BadRequest("ttl must be a non-negative integer (milliseconds)".to_string()))
    }

    fn string_list(&self, name: &str, action: &str) -> Result<Vec<String>, ApiError> {
        let value = self
            .json(name)?
            .ok_or_else(|| ApiError::BadRequest(format!("{name} is required for {action} action")))?;
        let Value::Array(items) = value else {
            return Err(ApiError::BadRequest(format!("Invalid {name} array")));
        };
        items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(ApiError::BadRequest(format!("Invalid {name} array"))),
            })
            .collect()
    }
}

/// Router with `/api/cache` and `/health`
pub fn router(store: Arc<dyn CacheStore>, default_ttl: Duration) -> Router {
    let state = ServerState { store, default_ttl };
    Router::new()
        .route("/api/cache", get(handle_query).post(handle_body))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve `app` until Ctrl-C
///
/// # Errors
///
/// Returns an error if the server stops with an I/O failure.
pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!(addr = %addr, "Cache server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await
        .context("Cache server failed")
}

async fn handle_query(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let params = query.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    dispatch(&state, &Params(params)).await
}

async fn handle_body(
    State(state): State<ServerState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let mut params: HashMap<String, Value> = if body.iter().all(u8::is_ascii_whitespace) {
        HashMap::new()
    } else {
        serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("Request body must be a JSON object".to_string()))?
    };
    for (k, v) in query {
        params.entry(k).or_insert(Value::String(v));
    }
    dispatch(&state, &Params(params)).await
}

async fn dispatch(state: &ServerState, params: &Params) -> Result<Json<Value>, ApiError> {
    let action = params.text("action").unwrap_or_default();
    debug!(action = %action, "[Server] Request");
    let store = &state.store;

    let body = match action.as_str() {
        "get" => {
            let key = params.required_text("key", "get")?;
            match store.get_entry(&key).await {
                Some(entry) => {
                    let mut body = json!({"cached": true, "data": entry.value});
                    if let Some(meta) = entry.meta {
                        body["timestamp"] = json!(meta.timestamp);
                        body["ttl"] = json!(meta.ttl);
                    }
                    body
                }
                None => json!({"cached": false, "data": null}),
            }
        }
        "set" => {
            let key = params.text("key");
            let data = params.json("data")?;
            let (Some(key), Some(data)) = (key, data) else {
                return Err(ApiError::BadRequest("key and data are required for set action".to_string()));
            };
            let ttl = params.ttl(state.default_ttl)?;
            let size = store.set(&key, data, ttl).await?;
            json!({"success": true, "cacheSize": size})
        }
        "delete" => {
            let key = params.required_text("key", "delete")?;
            store.delete(&key).await?;
            json!({"success": true})
        }
        "clear" => {
            store.clear().await?;
            json!({"success": true})
        }
        "stats" => serde_json::to_value(store.stats().await?).map_err(StoreError::from)?,
        "getMultiple" => {
            let keys = params.string_list("keys", "getMultiple")?;
            serde_json::to_value(store.get_multiple(&keys).await).map_err(StoreError::from)?
        }
        "setMultiple" => {
            let data = params
                .json("data")?
                .ok_or_else(|| ApiError::BadRequest("data is required for setMultiple action".to_string()))?;
            let Value::Object(entries) = data else {
                return Err(ApiError::BadRequest("data must be a JSON object".to_string()));
            };
            let ttl = params.ttl(state.default_ttl)?;
            let entries: BTreeMap<String, Value> = entries.into_iter().collect();
            store.set_multiple(entries, ttl).await?;
            json!({"success": true})
        }
        "getForceData" => {
            let force_id = params.required_text("forceId", "getForceData")?;
            let months = params.string_list("months", "getForceData")?;
            force_data(store.as_ref(), &force_id, &months).await
        }
        _ => {
            return Err(ApiError::BadRequest(format!("Invalid action. Use: {VALID_ACTIONS}")));
        }
    };
    Ok(Json(body))
}

/// Aggregated records of one force, keyed by month
async fn force_data(store: &dyn CacheStore, force_id: &str, months: &[String]) -> Value {
    let keys: Vec<String> = months.iter().map(|month| record_key(force_id, month)).collect();
    let bulk = store.get_multiple(&keys).await;

    let mut cached = serde_json::Map::new();
    let mut missing_months = Vec::new();
    for (month, key) in months.iter().zip(&keys) {
        match bulk.cached.get(key) {
            Some(data) => {
                cached.insert(month.clone(), data.clone());
            }
            None => missing_months.push(month.clone()),
        }
    }

    json!({
        "forceId": force_id,
        "cachedCount": cached.len(),
        "cached": cached,
        "missingMonths": missing_months,
        "totalMonths": months.len(),
    })
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    let healthy = state.store.health_check().await;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "store": state.store.name(),
        })),
    )
}
