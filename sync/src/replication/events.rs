//! Replication events.

use super::state::Phase;
use ferry_engine::{Checkpoint, DocumentId};
use serde::Serialize;

/// Something a replication engine did, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReplicationEvent {
    /// Remote documents were applied and the checkpoint advanced.
    Received {
        collection: String,
        ids: Vec<DocumentId>,
        checkpoint: Checkpoint,
    },
    /// Local documents were accepted by the remote.
    Sent {
        collection: String,
        ids: Vec<DocumentId>,
    },
    /// The remote changed these documents since they were last observed.
    Conflict {
        collection: String,
        ids: Vec<DocumentId>,
    },
    /// A pull replaced local edits that had not been pushed yet.
    LocalOverwritten {
        collection: String,
        ids: Vec<DocumentId>,
    },
    /// A cycle failed.
    Error {
        collection: String,
        message: String,
        retryable: bool,
    },
    PhaseChanged { collection: String, phase: Phase },
}

impl ReplicationEvent {
    pub fn collection(&self) -> &str {
        match self {
            ReplicationEvent::Received { collection, .. }
            | ReplicationEvent::Sent { collection, .. }
            | ReplicationEvent::Conflict { collection, .. }
            | ReplicationEvent::LocalOverwritten { collection, .. }
            | ReplicationEvent::Error { collection, .. }
            | ReplicationEvent::PhaseChanged { collection, .. } => collection,
        }
    }
}
