//! Storage backends.
//!
//! A backend is a flat key/value namespace per store name. The store owns
//! the layout (see [`crate::snapshot`]); backends only move bytes.

use crate::error::Result;
use crate::Error;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Durable byte storage for named stores.
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Read a key, `None` if absent.
    fn read(&self, store: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a key atomically: readers see the old or the new bytes, never
    /// a mix.
    fn write(&self, store: &str, key: &str, bytes: &[u8]) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, store: &str, key: &str) -> Result<()>;

    /// Keys currently present in a store.
    fn keys(&self, store: &str) -> Result<Vec<String>>;

    /// Wipe everything stored under `store` without interpreting it.
    ///
    /// This is the last-resort reset used when the store's own removal path
    /// cannot read its data.
    fn delete_by_name(&self, store: &str) -> Result<()>;
}

/// In-memory backend. Clones share the same data, so a test can "restart"
/// by opening a second store over a clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    stores: Arc<Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything is stored under `store`.
    pub fn contains_store(&self, store: &str) -> bool {
        self.stores
            .lock()
            .get(store)
            .is_some_and(|keys| !keys.is_empty())
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, store: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .stores
            .lock()
            .get(store)
            .and_then(|keys| keys.get(key).cloned()))
    }

    fn write(&self, store: &str, key: &str, bytes: &[u8]) -> Result<()> {
        self.stores
            .lock()
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, store: &str, key: &str) -> Result<()> {
        if let Some(keys) = self.stores.lock().get_mut(store) {
            keys.remove(key);
        }
        Ok(())
    }

    fn keys(&self, store: &str) -> Result<Vec<String>> {
        Ok(self
            .stores
            .lock()
            .get(store)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_by_name(&self, store: &str) -> Result<()> {
        self.stores.lock().remove(store);
        Ok(())
    }
}

/// One directory per store under `root`, one `<key>.json` file per key.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn store_dir(&self, store: &str) -> Result<PathBuf> {
        validate_name(store)?;
        Ok(self.root.join(store))
    }

    fn key_path(&self, store: &str, key: &str) -> Result<PathBuf> {
        validate_name(key)?;
        Ok(self.store_dir(store)?.join(format!("{key}.json")))
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(Error::Storage(format!("invalid storage name: {name:?}")))
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, store: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(store, key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, store: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.store_dir(store)?;
        fs::create_dir_all(&dir)?;
        let path = self.key_path(store, key)?;
        let tmp = dir.join(format!(".{key}.json.tmp"));

        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        debug!(store, key, bytes = bytes.len(), "Persisted key");
        Ok(())
    }

    fn remove(&self, store: &str, key: &str) -> Result<()> {
        let path = self.key_path(store, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self, store: &str) -> Result<Vec<String>> {
        let dir = self.store_dir(store)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn delete_by_name(&self, store: &str) -> Result<()> {
        let dir = self.store_dir(store)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                warn!(store, path = %dir.display(), "Deleted store directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
