//! Unified error handling for replication.

use crate::config::ConfigError;
use serde::Serialize;
use std::fmt;

/// A document the remote refused for a reason other than a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub id: String,
    pub error: String,
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}: {})", self.id, self.error, self.reason)
    }
}

/// Replication error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The change feed could not be read. The checkpoint is untouched and
    /// the next tick retries.
    #[error("pull failed for '{collection}': {reason}")]
    PullFailure { collection: String, reason: String },

    /// The remote rejected documents for reasons other than conflicts.
    #[error(
        "push to '{collection}' rejected {} document(s): {}",
        .rejections.len(),
        .rejections.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    )]
    PushFailure {
        collection: String,
        rejections: Vec<Rejection>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote returned {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("malformed remote response: {0}")]
    Decode(String),

    #[error("invalid remote URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] ferry_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("replication cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the next scheduled cycle may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::PullFailure { .. } | SyncError::Http(_) => true,
            SyncError::Status { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            SyncError::PushFailure { .. }
            | SyncError::Decode(_)
            | SyncError::InvalidUrl { .. }
            | SyncError::Store(_)
            | SyncError::Config(_)
            | SyncError::Cancelled => false,
        }
    }
}

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, SyncError>;
