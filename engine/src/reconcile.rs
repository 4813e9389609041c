//! Conflict resolution policies.
//!
//! A push conflict means the remote copy of a document changed since it
//! was last observed. The replication engine never resolves conflicts
//! itself; it returns the authoritative remote document and the caller
//! picks a [`MergeStrategy`], applied through
//! [`Store::resolve_conflict`](crate::Store::resolve_conflict).
//!
//! Resolution is deterministic: the same local and remote documents always
//! produce the same [`Resolution`].

use crate::Document;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Merge strategy for conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStrategy {
    /// The remote document always replaces the local one
    RemoteWins,
    /// The local document is kept and pushed again
    LocalWins,
    /// Higher `updatedAt` wins, ties go to the remote (default)
    #[default]
    LatestWins,
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "remotewins" | "remote" => Ok(Self::RemoteWins),
            "localwins" | "local" => Ok(Self::LocalWins),
            "latestwins" | "latest" => Ok(Self::LatestWins),
            other => Err(format!("unknown merge strategy: {other}")),
        }
    }
}

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    /// Local document kept; it stays pending and is pushed again
    KeptLocal,
    /// Remote document applied locally
    TookRemote,
}

impl MergeStrategy {
    /// Pick the winner between the local copy (if any) and the remote one.
    ///
    /// A local copy with no unpushed edits has nothing to protect, so the
    /// remote always wins against it.
    pub fn decide(&self, local: Option<&Document>, remote: &Document) -> Resolution {
        let Some(local) = local.filter(|d| d.is_pending()) else {
            return Resolution::TookRemote;
        };

        match self {
            MergeStrategy::RemoteWins => Resolution::TookRemote,
            MergeStrategy::LocalWins => Resolution::KeptLocal,
            MergeStrategy::LatestWins => {
                if local.metadata.updated_at > remote.metadata.updated_at {
                    Resolution::KeptLocal
                } else {
                    Resolution::TookRemote
                }
            }
        }
    }
}
