//! On-disk formats for a store.
//!
//! A store is persisted as one header (`_meta`) plus one file per
//! collection. Both use BTreeMap so serialization order is deterministic
//! and files diff cleanly.

use crate::{
    checkpoint::Checkpoint, crypto::EncryptionHeader, error::Result,
    migration::CollectionMetadataRecord, CollectionName, Document, DocumentId, Error,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the on-disk format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Storage key of the header.
pub const HEADER_KEY: &str = "_meta";

/// Store-wide state: schema metadata records, checkpoints and encryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHeader {
    /// On-disk format version
    pub format_version: u32,
    /// Present when the store was created with a passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionHeader>,
    /// One record per migration that ran, including tombstoned duplicates
    #[serde(default)]
    pub metadata: Vec<CollectionMetadataRecord>,
    /// Replication progress per collection
    #[serde(default)]
    pub checkpoints: BTreeMap<CollectionName, Checkpoint>,
}

impl StoreHeader {
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            encryption: None,
            metadata: Vec::new(),
            checkpoints: BTreeMap::new(),
        }
    }

    /// Collections that have ever been registered in this store.
    pub fn collection_names(&self) -> Vec<CollectionName> {
        let mut names: Vec<_> = self.metadata.iter().map(|m| m.collection.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::Storage(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: Self = serde_json::from_slice(bytes).map_err(|e| Error::Corrupt {
            key: HEADER_KEY.into(),
            reason: e.to_string(),
        })?;

        if header.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::Corrupt {
                key: HEADER_KEY.into(),
                reason: format!(
                    "unsupported format version: {} (max supported: {})",
                    header.format_version, SNAPSHOT_FORMAT_VERSION
                ),
            });
        }

        Ok(header)
    }
}

impl Default for StoreHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// All documents of one collection, tombstones included, as stored.
///
/// Encrypted fields are sealed in this form; the store opens them on load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshot {
    pub documents: BTreeMap<DocumentId, Document>,
}

#[derive(Serialize)]
struct BorrowedSnapshot<'a> {
    documents: &'a BTreeMap<DocumentId, Document>,
}

impl CollectionSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Self::encode(&self.documents)
    }

    /// Serialize a document map without copying it into a snapshot first.
    pub fn encode(documents: &BTreeMap<DocumentId, Document>) -> Result<Vec<u8>> {
        serde_json::to_vec(&BorrowedSnapshot { documents })
            .map_err(|e| Error::Storage(e.to_string()))
    }

    pub fn from_bytes(collection: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Corrupt {
            key: collection.to_string(),
            reason: e.to_string(),
        })
    }

    /// Count live (non-deleted) documents.
    pub fn active_count(&self) -> usize {
        self.documents.values().filter(|d| d.is_active()).count()
    }
}
