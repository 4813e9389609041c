//! Collections replicated by default.
//!
//! `createdAt` and `updatedAt` are managed by the store and are not declared
//! here.

use crate::config::ConfigError;
use ferry_engine::{CollectionSchema, FieldDef, FieldType};

/// Every collection the daemon replicates when none are configured.
pub const DEFAULT_COLLECTIONS: [&str; 7] = [
    "projects",
    "areas",
    "tasks",
    "resources",
    "habits",
    "metrics",
    "logs",
];

/// Schema for one of [`DEFAULT_COLLECTIONS`].
pub fn schema_for(collection: &str) -> Option<CollectionSchema> {
    let schema = match collection {
        "projects" => CollectionSchema::new(
            "projects",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("description", FieldType::String),
                // active, paused, completed or archived
                FieldDef::optional("status", FieldType::String),
                FieldDef::optional("progress", FieldType::Float),
                FieldDef::optional("areaId", FieldType::String),
            ],
        ),
        "areas" => CollectionSchema::new(
            "areas",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("coverImage", FieldType::String),
                FieldDef::optional("description", FieldType::String),
            ],
        ),
        "tasks" => CollectionSchema::new(
            "tasks",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("completed", FieldType::Bool),
                FieldDef::optional("projectId", FieldType::String),
            ],
        ),
        "resources" => CollectionSchema::new(
            "resources",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("type", FieldType::String),
                FieldDef::optional("url", FieldType::String),
                FieldDef::optional("content", FieldType::String),
                FieldDef::optional("context", FieldType::String),
            ],
        )
        .encrypted(["content"]),
        "habits" => CollectionSchema::new(
            "habits",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("frequency", FieldType::String),
            ],
        ),
        "metrics" => CollectionSchema::new(
            "metrics",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("type", FieldType::String),
            ],
        ),
        "logs" => CollectionSchema::new(
            "logs",
            vec![
                FieldDef::required("date", FieldType::Timestamp),
                FieldDef::optional("value", FieldType::String),
                FieldDef::optional("metricId", FieldType::String),
                FieldDef::optional("habitId", FieldType::String),
            ],
        ),
        _ => return None,
    };
    Some(schema)
}

/// Schemas for `names`, or for every default collection when `names` is
/// empty.
pub fn resolve(names: &[String]) -> Result<Vec<CollectionSchema>, ConfigError> {
    if names.is_empty() {
        return Ok(DEFAULT_COLLECTIONS.iter().filter_map(|name| schema_for(name)).collect());
    }
    names
        .iter()
        .map(|name| schema_for(name).ok_or_else(|| ConfigError::UnknownCollection(name.clone())))
        .collect()
}
