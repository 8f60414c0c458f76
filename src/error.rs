//! Error taxonomy
//!
//! Faults are modelled as a closed set of kinds so callers can match on them
//! exhaustively. Absence (cache miss, expired entry) is never an error: it is
//! an ordinary `None` / missing-key result.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed classification of every fault the core can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Upstream answered 404; not retried
    NotFound,
    /// Upstream answered 429; retried per policy, surfaced once exhausted
    RateLimited,
    /// Upstream answered 5xx (or another unexpected status); not retried
    UpstreamUnavailable,
    /// Network or connection failure before a status was received
    Unreachable,
    /// Upstream answered 200 but the payload is not an incident array
    InvalidResponse,
    /// Durable snapshot could not be read back
    StoreCorrupt,
}

impl ErrorKind {
    /// Whether the orchestrator retries this kind
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "NotFound",
            Self::RateLimited => "RateLimited",
            Self::UpstreamUnavailable => "UpstreamUnavailable",
            Self::Unreachable => "Unreachable",
            Self::InvalidResponse => "InvalidResponse",
            Self::StoreCorrupt => "StoreCorrupt",
        };
        f.write_str(name)
    }
}

/// Classified upstream failure
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("{kind}: {message}")]
pub struct FetchError {
    /// Classification, drives retry and fallback decisions
    pub kind: ErrorKind,
    /// Human readable detail
    pub message: String,
    /// HTTP status when one was received
    pub status: Option<u16>,
}

impl FetchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Classify a non-success HTTP status
    #[must_use]
    pub fn from_status(status: u16, reason: &str) -> Self {
        let kind = match status {
            404 => ErrorKind::NotFound,
            429 => ErrorKind::RateLimited,
            _ => ErrorKind::UpstreamUnavailable,
        };
        let message = match kind {
            ErrorKind::NotFound => {
                "requested data was not found; the period may not be published yet".to_string()
            }
            ErrorKind::RateLimited => "upstream is rate limiting requests".to_string(),
            _ if status >= 500 => format!("upstream service is unavailable ({status} {reason})"),
            _ => format!("upstream request failed ({status} {reason})"),
        };
        Self::new(kind, message).with_status(status)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unreachable, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResponse, message)
    }
}

/// Durable store failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot exists but cannot be parsed
    #[error("store snapshot is corrupt: {0}")]
    Corrupt(String),

    /// Remote cache server rejected or failed the request
    #[error("remote store request failed: {0}")]
    Remote(String),
}

impl StoreError {
    /// Taxonomy kind, when this failure maps onto one
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Corrupt(_) => Some(ErrorKind::StoreCorrupt),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::Remote(err.to_string())
    }
}
