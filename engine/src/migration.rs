//! Collection metadata records and the migration plan derived from them.
//!
//! Each time a collection is opened at a new schema version a
//! [`CollectionMetadataRecord`] is appended to the store header. An
//! interrupted migration can leave several live records for one collection;
//! [`dedupe`] keeps the highest version and tombstones the rest before the
//! store decides what to migrate.

use crate::schema::{CollectionSchema, SchemaShape};
use crate::{error::Result, CollectionName, Error, SchemaVersion, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Durable proof that a collection was brought to `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMetadataRecord {
    pub collection: CollectionName,
    pub version: SchemaVersion,
    /// Structural shape the collection had at this version
    pub shape: SchemaShape,
    pub migrated_at: Timestamp,
    /// Tombstone for superseded duplicates
    #[serde(default)]
    pub deleted: bool,
}

impl CollectionMetadataRecord {
    pub fn new(shape: SchemaShape, migrated_at: Timestamp) -> Self {
        Self {
            collection: shape.name.clone(),
            version: shape.version,
            shape,
            migrated_at,
            deleted: false,
        }
    }
}

/// Keep the highest-version live record for `collection`, tombstone every
/// other live record for it, and return the survivor.
///
/// Returns the number of records tombstoned alongside the survivor.
pub fn dedupe(
    records: &mut [CollectionMetadataRecord],
    collection: &str,
) -> (Option<CollectionMetadataRecord>, usize) {
    let winner = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.collection == collection && !r.deleted)
        .max_by_key(|(_, r)| (r.version, r.migrated_at))
        .map(|(i, _)| i);

    let Some(winner) = winner else {
        return (None, 0);
    };

    let mut tombstoned = 0;
    for (i, record) in records.iter_mut().enumerate() {
        if i != winner && record.collection == collection && !record.deleted {
            record.deleted = true;
            tombstoned += 1;
        }
    }
    if tombstoned > 0 {
        warn!(
            collection,
            tombstoned, "Tombstoned duplicate collection metadata records"
        );
    }

    (Some(records[winner].clone()), tombstoned)
}

/// Tombstone every live record for `collection` ahead of appending its
/// new current record. Returns how many were tombstoned.
pub fn supersede(records: &mut [CollectionMetadataRecord], collection: &str) -> usize {
    let mut superseded = 0;
    for record in records
        .iter_mut()
        .filter(|r| r.collection == collection && !r.deleted)
    {
        record.deleted = true;
        superseded += 1;
    }
    superseded
}

/// What opening a collection requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationPlan {
    /// Never opened before; nothing on disk to migrate.
    Fresh,
    /// Persisted at the registered version.
    UpToDate,
    /// Documents below the registered version must be migrated from `from`.
    Upgrade { from: SchemaVersion },
}

/// Decide how to open `schema` given the current metadata record.
///
/// Fails with [`Error::SchemaConflict`] when the persisted data cannot be
/// brought to the registered schema.
pub fn plan(
    schema: &CollectionSchema,
    current: Option<&CollectionMetadataRecord>,
) -> Result<MigrationPlan> {
    let Some(current) = current else {
        return Ok(MigrationPlan::Fresh);
    };
    let registered = schema.current_version();

    if current.version > registered {
        return Err(Error::SchemaConflict {
            collection: schema.name().clone(),
            reason: format!(
                "persisted version {} is newer than registered version {}",
                current.version, registered
            ),
        });
    }

    if current.version == registered {
        current
            .shape
            .is_compatible_with(schema.shape())
            .map_err(|reason| Error::SchemaConflict {
                collection: schema.name().clone(),
                reason,
            })?;
        return Ok(MigrationPlan::UpToDate);
    }

    schema
        .has_migration_path(current.version)
        .map_err(|e| Error::SchemaConflict {
            collection: schema.name().clone(),
            reason: e.to_string(),
        })?;
    debug!(
        collection = %schema.name(),
        from = current.version,
        to = registered,
        "Collection needs migration"
    );
    Ok(MigrationPlan::Upgrade {
        from: current.version,
    })
}
