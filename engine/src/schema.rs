//! Schema definition, validation and migrations.
//!
//! A [`CollectionSchema`] describes one version of a collection: its fields,
//! primary key, encrypted fields, and the migration steps that bring older
//! documents up to this version. The serializable part of a schema is its
//! [`SchemaShape`], which is persisted alongside the data so a later open can
//! tell whether the on-disk layout is still readable.

use crate::{error::Result, CollectionName, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// A pure transform that upgrades a document's fields by one version.
///
/// Steps must be total and idempotent: running a step on a document it has
/// already upgraded must leave that document unchanged.
#[derive(Clone)]
pub struct MigrationStep(Arc<dyn Fn(Map<String, Value>) -> Map<String, Value> + Send + Sync>);

impl MigrationStep {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Map<String, Value> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, fields: Map<String, Value>) -> Map<String, Value> {
        (self.0)(fields)
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MigrationStep(..)")
    }
}

/// Structural description of a collection version, persisted with the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaShape {
    pub name: CollectionName,
    pub version: SchemaVersion,
    pub primary_key: String,
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub encrypted: Vec<String>,
}

impl SchemaShape {
    /// Whether data written under `self` can be read by `registered` without
    /// a migration. Only meaningful when both have the same version.
    pub fn is_compatible_with(&self, registered: &SchemaShape) -> std::result::Result<(), String> {
        if self.primary_key != registered.primary_key {
            return Err(format!(
                "primary key changed from '{}' to '{}'",
                self.primary_key, registered.primary_key
            ));
        }
        for field in &self.fields {
            if let Some(other) = registered.fields.iter().find(|f| f.name == field.name) {
                if other.field_type != field.field_type {
                    return Err(format!(
                        "field '{}' changed type from {} to {}",
                        field.name, field.field_type, other.field_type
                    ));
                }
            }
        }
        for field in registered.fields.iter().filter(|f| f.required) {
            if !self.fields.iter().any(|f| f.name == field.name) {
                return Err(format!("new required field '{}'", field.name));
            }
        }
        Ok(())
    }
}

/// Schema for one version of a collection.
#[derive(Debug, Clone)]
pub struct CollectionSchema {
    shape: SchemaShape,
    /// Steps keyed by the version they produce.
    migrations: BTreeMap<SchemaVersion, MigrationStep>,
}

impl CollectionSchema {
    /// Create a version 0 schema keyed on `id`.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            shape: SchemaShape {
                name: name.into(),
                version: 0,
                primary_key: "id".to_string(),
                fields,
                encrypted: Vec::new(),
            },
            migrations: BTreeMap::new(),
        }
    }

    pub fn version(mut self, version: SchemaVersion) -> Self {
        self.shape.version = version;
        self
    }

    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.shape.primary_key = field.into();
        self
    }

    /// Mark fields that are encrypted at rest when the store has a password.
    pub fn encrypted<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shape.encrypted = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Register the step that upgrades `target - 1` documents to `target`.
    pub fn migration<F>(mut self, target: SchemaVersion, step: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Map<String, Value> + Send + Sync + 'static,
    {
        self.migrations.insert(target, MigrationStep::new(step));
        self
    }

    pub fn name(&self) -> &CollectionName {
        &self.shape.name
    }

    pub fn current_version(&self) -> SchemaVersion {
        self.shape.version
    }

    pub fn primary_key_field(&self) -> &str {
        &self.shape.primary_key
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.shape.fields
    }

    pub fn encrypted_fields(&self) -> &[String] {
        &self.shape.encrypted
    }

    pub fn shape(&self) -> &SchemaShape {
        &self.shape
    }

    /// Check that every step from `from + 1` up to the current version exists.
    pub fn has_migration_path(&self, from: SchemaVersion) -> Result<()> {
        for version in (from + 1)..=self.shape.version {
            if !self.migrations.contains_key(&version) {
                return Err(Error::MissingMigration {
                    collection: self.shape.name.clone(),
                    version,
                });
            }
        }
        Ok(())
    }

    /// Run every step after `from`, in order.
    pub fn migrate(
        &self,
        mut fields: Map<String, Value>,
        from: SchemaVersion,
    ) -> Result<Map<String, Value>> {
        if from >= self.shape.version {
            return Ok(fields);
        }
        self.has_migration_path(from)?;
        for (_, step) in self.migrations.range((from + 1)..=self.shape.version) {
            fields = step.apply(fields);
        }
        Ok(fields)
    }

    /// Validate a document's fields against this schema.
    pub fn validate_payload(&self, payload: &Map<String, Value>) -> Result<()> {
        for field in &self.shape.fields {
            field.validate(payload.get(&field.name))?;
        }
        Ok(())
    }

    /// Validate an arbitrary JSON value, which must be an object.
    pub fn validate_value(&self, payload: &Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;
        self.validate_payload(obj)
    }
}

/// Binds a Rust type to its collection at compile time.
///
/// ```rust
/// use ferry_engine::{CollectionSchema, FieldDef, FieldType, Model};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Area {
///     id: String,
///     title: String,
/// }
///
/// impl Model for Area {
///     const COLLECTION: &'static str = "areas";
///
///     fn schema() -> CollectionSchema {
///         CollectionSchema::new("areas", vec![FieldDef::required("title", FieldType::String)])
///     }
/// }
/// ```
pub trait Model: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn schema() -> CollectionSchema;
}
