//! Upstream incident source
//!
//! [`IncidentSource`] is the seam between the orchestrator and the network.
//! [`PoliceApiSource`] talks to the public stop-and-search API and classifies
//! every HTTP outcome into a [`FetchError`].

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::debug;

use crate::aggregation::RawIncident;
use crate::config::FetchConfig;
use crate::error::{ErrorKind, FetchError};

/// Reporting period: a calendar month or the most recent published month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    Month { year: u16, month: u8 },
    Latest,
}

impl Period {
    /// Value for the upstream `date` query parameter; `None` for `Latest`
    #[must_use]
    pub fn as_query(&self) -> Option<String> {
        match self {
            Self::Month { .. } => Some(self.to_string()),
            Self::Latest => None,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            Self::Latest => f.write_str("latest"),
        }
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Rejected period string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid period '{0}', expected YYYY-MM or 'latest'")]
pub struct InvalidPeriod(pub String);

impl FromStr for Period {
    type Err = InvalidPeriod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        let invalid = || InvalidPeriod(s.to_string());
        let (year, month) = raw.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: u16 = year.parse().map_err(|_| invalid())?;
        let month: u8 = month.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }
        Ok(Self::Month { year, month })
    }
}

/// Producer of raw incidents for one entity and period
#[async_trait]
pub trait IncidentSource: Send + Sync {
    /// Fetch the complete incident batch
    ///
    /// # Errors
    ///
    /// Returns a classified [`FetchError`] on any non-success outcome.
    async fn fetch_incidents(&self, entity_id: &str, period: &Period) -> Result<Vec<RawIncident>, FetchError>;

    /// Months with published data, newest first
    ///
    /// # Errors
    ///
    /// Returns a classified [`FetchError`]; sources that do not publish
    /// availability answer `NotFound`.
    async fn available_datasets(&self) -> Result<Vec<DatasetAvailability>, FetchError> {
        Err(FetchError::new(
            ErrorKind::NotFound,
            "dataset availability is not published by this source",
        ))
    }

    /// Name for logging
    fn name(&self) -> &'static str {
        "incident-source"
    }
}

/// One published month and the entities that have data for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetAvailability {
    pub period: Period,
    pub entities: Vec<String>,
}

#[derive(Deserialize)]
struct RawDataset {
    #[serde(default)]
    date: Option<String>,
    #[serde(rename = "stop-and-search", default)]
    stop_and_search: Vec<Value>,
}

/// Decode the availability list `[{date, "stop-and-search": [ids]}]`
///
/// Entries without a parsable month or without any entity are dropped; the
/// rest are sorted newest first.
///
/// # Errors
///
/// Returns `InvalidResponse` if `payload` is not an array.
pub fn parse_datasets(payload: Value) -> Result<Vec<DatasetAvailability>, FetchError> {
    let Value::Array(items) = payload else {
        return Err(FetchError::invalid_response("expected a JSON array of datasets"));
    };
    let mut datasets: Vec<DatasetAvailability> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawDataset>(item).ok())
        .filter_map(|raw| {
            let period = match raw.date?.parse::<Period>().ok()? {
                month @ Period::Month { .. } => month,
                Period::Latest => return None,
            };
            let entities: Vec<String> = raw
                .stop_and_search
                .into_iter()
                .filter_map(|id| match id {
                    Value::String(id) if !id.is_empty() => Some(id),
                    _ => None,
                })
                .collect();
            (!entities.is_empty()).then_some(DatasetAvailability { period, entities })
        })
        .collect();
    datasets.sort_by(|a, b| b.period.cmp(&a.period));
    Ok(datasets)
}

/// Decode an upstream payload; anything but a JSON array is `InvalidResponse`
///
/// Array elements that are not objects are skipped.
///
/// # Errors
///
/// Returns `InvalidResponse` if `payload` is not an array.
pub fn parse_incidents(payload: Value) -> Result<Vec<RawIncident>, FetchError> {
    let Value::Array(items) = payload else {
        return Err(FetchError::invalid_response("expected a JSON array of incidents"));
    };
    Ok(items
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

/// HTTP client for `GET {base}/stops-force?force=..&date=..`
#[derive(Debug, Clone)]
pub struct PoliceApiSource {
    client: reqwest::Client,
    base_url: String,
}

impl PoliceApiSource {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/stops-force", self.base_url)
    }

    async fn get_json(&self, url: String, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| FetchError::unreachable(format!("request to upstream failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::from_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::unreachable(format!("failed to read upstream body: {e}")))?;
        serde_json::from_slice(&body)
            .map_err(|e| FetchError::invalid_response(format!("upstream body is not JSON: {e}")))
    }
}

#[async_trait]
impl IncidentSource for PoliceApiSource {
    async fn fetch_incidents(&self, entity_id: &str, period: &Period) -> Result<Vec<RawIncident>, FetchError> {
        let mut query = vec![("force", entity_id.to_string())];
        if let Some(date) = period.as_query() {
            query.push(("date", date));
        }

        let payload = self.get_json(self.endpoint(), &query).await?;
        let incidents = parse_incidents(payload)?;

        debug!(entity = %entity_id, period = %period, count = incidents.len(), "[Upstream] Fetched incidents");
        Ok(incidents)
    }

    async fn available_datasets(&self) -> Result<Vec<DatasetAvailability>, FetchError> {
        let payload = self
            .get_json(format!("{}/crimes-street-dates", self.base_url), &[])
            .await?;
        let datasets = parse_datasets(payload)?;
        debug!(count = datasets.len(), "[Upstream] Fetched dataset availability");
        Ok(datasets)
    }

    fn name(&self) -> &'static str {
        "police-api"
    }
}
