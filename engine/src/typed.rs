//! Typed access to a collection through its [`Model`].

use crate::{error::Result, Document, Error, Model, Store};
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::marker::PhantomData;

/// The CRUD and observe contract of a [`Store`], over `T` instead of raw
/// JSON. Obtain one with [`Store::collection`].
pub struct TypedCollection<T: Model> {
    store: Store,
    primary_key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Model> Clone for TypedCollection<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            primary_key: self.primary_key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Model> std::fmt::Debug for TypedCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCollection")
            .field("collection", &T::COLLECTION)
            .finish()
    }
}

impl Store {
    /// Typed handle for `T`'s collection, registering it if needed.
    pub fn collection<T: Model>(&self) -> Result<TypedCollection<T>> {
        let schema = T::schema();
        if schema.name() != T::COLLECTION {
            return Err(Error::SchemaConflict {
                collection: T::COLLECTION.to_string(),
                reason: format!("model schema is named '{}'", schema.name()),
            });
        }
        let primary_key = schema.primary_key_field().to_string();
        self.add_collection(schema)?;
        Ok(TypedCollection {
            store: self.clone(),
            primary_key,
            _marker: PhantomData,
        })
    }
}

fn decode<T: Model>(doc: &Document, primary_key: &str) -> Result<T> {
    serde_json::from_value(doc.to_json_with_key(primary_key)).map_err(|e| {
        Error::InvalidPayload(format!(
            "document '{}' does not decode as {}: {e}",
            doc.id,
            T::COLLECTION
        ))
    })
}

fn encode<T: Model>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(Error::InvalidPayload(format!(
            "{} must serialize to a JSON object",
            T::COLLECTION
        ))),
        Err(e) => Err(Error::InvalidPayload(e.to_string())),
    }
}

impl<T: Model> TypedCollection<T> {
    pub fn get(&self, id: &str) -> Result<Option<T>> {
        self.store
            .get(T::COLLECTION, id)?
            .map(|doc| decode(&doc, &self.primary_key))
            .transpose()
    }

    pub fn find<F>(&self, predicate: F) -> Result<Vec<T>>
    where
        F: Fn(&T) -> bool,
    {
        let mut out = Vec::new();
        for doc in self.store.all(T::COLLECTION)? {
            let value = decode::<T>(&doc, &self.primary_key)?;
            if predicate(&value) {
                out.push(value);
            }
        }
        Ok(out)
    }

    pub fn all(&self) -> Result<Vec<T>> {
        self.find(|_| true)
    }

    /// Insert `value`, returning it as stored (with id and timestamps).
    pub fn insert(&self, value: &T) -> Result<T> {
        let doc = self
            .store
            .insert(T::COLLECTION, Value::Object(encode(value)?))?;
        decode(&doc, &self.primary_key)
    }

    /// Atomic read-modify-write; see [`Store::update`].
    pub fn update<F>(&self, id: &str, mutator: F) -> Result<T>
    where
        F: Fn(T) -> T,
    {
        let primary_key = self.primary_key.as_str();
        let doc = self.store.update_with(T::COLLECTION, id, |current| {
            let value = decode::<T>(current, primary_key)?;
            encode(&mutator(value))
        })?;
        decode(&doc, primary_key)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.store.remove(T::COLLECTION, id)
    }

    pub fn observe(&self, id: &str) -> Result<BoxStream<'static, Option<T>>> {
        let primary_key = self.primary_key.clone();
        Ok(self
            .store
            .observe(T::COLLECTION, id)?
            .map(move |doc| doc.and_then(|d| decode(&d, &primary_key).ok()))
            .boxed())
    }

    /// Live documents that fail to decode are skipped.
    pub fn observe_all(&self) -> Result<BoxStream<'static, Vec<T>>> {
        let primary_key = self.primary_key.clone();
        Ok(self
            .store
            .observe_all(T::COLLECTION)?
            .map(move |docs| {
                docs.iter()
                    .filter_map(|d| decode(d, &primary_key).ok())
                    .collect()
            })
            .boxed())
    }
}
