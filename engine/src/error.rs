//! Error types for the Ferry engine.

use crate::{CollectionName, DocumentId, SchemaVersion};
use thiserror::Error;

/// All possible errors from the Ferry engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Write errors
    #[error("document already exists: {0}")]
    DocumentAlreadyExists(DocumentId),

    #[error("update of '{id}' gave up after {attempts} concurrent modifications")]
    UpdateContention { id: DocumentId, attempts: usize },

    // Open-time errors
    #[error("credential mismatch: {0}")]
    CredentialMismatch(String),

    #[error("schema conflict in collection '{collection}': {reason}")]
    SchemaConflict {
        collection: CollectionName,
        reason: String,
    },

    #[error("missing migration for collection '{collection}' to version {version}")]
    MissingMigration {
        collection: CollectionName,
        version: SchemaVersion,
    },

    #[error(
        "database '{name}' could not be recovered ({}); clear the persisted storage manually",
        .stages.join("; ")
    )]
    DatabaseRecovery { name: String, stages: Vec<String> },

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt data in '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("encryption error: {0}")]
    Encryption(String),
}

/// Coarse classification used by callers to pick a reaction without
/// matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input from the caller.
    Validation,
    /// Passphrase cannot read the existing store.
    CredentialMismatch,
    /// Persisted schema cannot be brought to the registered one.
    SchemaConflict,
    /// Every recovery tier failed. Fatal.
    RecoveryExhausted,
    /// Underlying storage failed or holds unreadable data.
    Storage,
    /// Optimistic update lost too many races.
    Contention,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CollectionNotFound(_)
            | Error::DocumentNotFound(_)
            | Error::InvalidPayload(_)
            | Error::MissingRequiredField(_)
            | Error::TypeMismatch { .. }
            | Error::DocumentAlreadyExists(_) => ErrorKind::Validation,
            Error::UpdateContention { .. } => ErrorKind::Contention,
            Error::CredentialMismatch(_) => ErrorKind::CredentialMismatch,
            Error::SchemaConflict { .. } | Error::MissingMigration { .. } => {
                ErrorKind::SchemaConflict
            }
            Error::DatabaseRecovery { .. } => ErrorKind::RecoveryExhausted,
            Error::Storage(_) | Error::Corrupt { .. } | Error::Encryption(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Whether a destructive reset of the local store can clear this error.
    pub fn is_reset_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CredentialMismatch | ErrorKind::SchemaConflict
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
