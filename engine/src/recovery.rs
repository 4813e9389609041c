//! Opening a store with automatic reset on unrecoverable local state.
//!
//! During development a schema change without a migration, or a changed
//! passphrase, leaves local data that can never be opened again. In
//! [`RecoveryMode::Development`] the store is removed and recreated instead
//! of failing; in [`RecoveryMode::Production`] every error is returned
//! unchanged so no user data is ever discarded implicitly.
//!
//! Recovery escalates through two tiers:
//!
//! 1. [`Store::remove_store`], which goes through the store's own layout and
//!    leaves the data untouched if it cannot read it.
//! 2. [`StorageBackend::delete_by_name`], which wipes the raw storage.
//!
//! If the store still does not open, [`Error::DatabaseRecovery`] lists the
//! failure of every stage.

use crate::{error::Result, storage::StorageBackend, Error, Store, StoreBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Whether failed opens may discard local data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    /// Reset the store on credential or schema errors
    Development,
    /// Never reset; propagate every error
    #[default]
    Production,
}

impl FromStr for RecoveryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown recovery mode: {other}")),
        }
    }
}

impl fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryMode::Development => f.write_str("development"),
            RecoveryMode::Production => f.write_str("production"),
        }
    }
}

/// Runs an open routine and resets the store when it fails recoverably.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    backend: Arc<dyn StorageBackend>,
    name: String,
    mode: RecoveryMode,
}

impl RecoveryManager {
    pub fn new(backend: Arc<dyn StorageBackend>, name: impl Into<String>, mode: RecoveryMode) -> Self {
        Self {
            backend,
            name: name.into(),
            mode,
        }
    }

    /// Manager for the store a builder opens.
    pub fn for_builder(builder: &StoreBuilder, mode: RecoveryMode) -> Self {
        Self::new(builder.backend().clone(), builder.name(), mode)
    }

    pub fn mode(&self) -> RecoveryMode {
        self.mode
    }

    /// Call `open_fn`, resetting the store and calling it again if it fails
    /// with a credential or schema error in development mode.
    ///
    /// # Errors
    ///
    /// - The original error in production mode, or when it is not
    ///   [reset-recoverable](Error::is_reset_recoverable).
    /// - [`Error::DatabaseRecovery`] when every recovery tier failed.
    pub fn init_with_recovery<F>(&self, open_fn: F) -> Result<Store>
    where
        F: Fn() -> Result<Store>,
    {
        let first = match open_fn() {
            Ok(store) => return Ok(store),
            Err(e) => e,
        };

        if self.mode == RecoveryMode::Production || !first.is_reset_recoverable() {
            return Err(first);
        }

        warn!(store = %self.name, error = %first, "Store failed to open, removing it");
        let mut stages = vec![format!("open: {first}")];

        match Store::remove_store(self.backend.as_ref(), &self.name) {
            Ok(()) => match open_fn() {
                Ok(store) => {
                    info!(store = %self.name, "Store recreated after removal");
                    return Ok(store);
                }
                Err(e) => {
                    warn!(store = %self.name, error = %e, "Open failed after removal");
                    stages.push(format!("open after removal: {e}"));
                }
            },
            Err(e) => {
                warn!(store = %self.name, error = %e, "Store removal failed");
                stages.push(format!("remove: {e}"));
            }
        }

        warn!(store = %self.name, "Wiping store storage");
        match self.backend.delete_by_name(&self.name) {
            Ok(()) => match open_fn() {
                Ok(store) => {
                    info!(store = %self.name, "Store recreated after wipe");
                    return Ok(store);
                }
                Err(e) => stages.push(format!("open after wipe: {e}")),
            },
            Err(e) => stages.push(format!("delete_by_name: {e}")),
        }

        error!(store = %self.name, ?stages, "Store recovery exhausted");
        Err(Error::DatabaseRecovery {
            name: self.name.clone(),
            stages,
        })
    }
}

impl StoreBuilder {
    /// Open through a [`RecoveryManager`] in `mode`.
    pub fn open_with_recovery(self, mode: RecoveryMode) -> Result<Store> {
        let manager = RecoveryManager::for_builder(&self, mode);
        manager.init_with_recovery(|| self.clone().open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CollectionSchema, FieldDef, FieldType};
    use crate::storage::MemoryBackend;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegates to memory but can be told to fail removals.
    #[derive(Debug, Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_remove: bool,
        fail_wipe: bool,
    }

    impl StorageBackend for FlakyBackend {
        fn read(&self, store: &str, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.read(store, key)
        }
        fn write(&self, store: &str, key: &str, bytes: &[u8]) -> Result<()> {
            self.inner.write(store, key, bytes)
        }
        fn remove(&self, store: &str, key: &str) -> Result<()> {
            if self.fail_remove {
                return Err(Error::Storage("remove refused".into()));
            }
            self.inner.remove(store, key)
        }
        fn keys(&self, store: &str) -> Result<Vec<String>> {
            self.inner.keys(store)
        }
        fn delete_by_name(&self, store: &str) -> Result<()> {
            if self.fail_wipe {
                return Err(Error::Storage("wipe refused".into()));
            }
            self.inner.delete_by_name(store)
        }
    }

    fn tasks(version: u32) -> CollectionSchema {
        CollectionSchema::new("tasks", vec![FieldDef::required("title", FieldType::String)])
            .version(version)
    }

    fn seed(backend: Arc<dyn StorageBackend>, password: &str) {
        let store = Store::builder("db", backend)
            .password(password)
            .collection(tasks(0))
            .open()
            .unwrap();
        store.insert("tasks", json!({"id": "t1", "title": "a"})).unwrap();
    }

    #[test]
    fn production_propagates() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        seed(backend.clone(), "old");

        let result = Store::builder("db", backend.clone())
            .password("new")
            .collection(tasks(0))
            .open_with_recovery(RecoveryMode::Production);
        assert!(matches!(result, Err(Error::CredentialMismatch(_))));
        assert!(backend.read("db", "tasks").unwrap().is_some());
    }

    #[test]
    fn development_recreates_on_credential_mismatch() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        seed(backend.clone(), "old");

        let store = Store::builder("db", backend)
            .password("new")
            .collection(tasks(0))
            .open_with_recovery(RecoveryMode::Development)
            .unwrap();
        assert!(store.is_encrypted());
        assert_eq!(store.count("tasks").unwrap(), 0);
    }

    #[test]
    fn development_recreates_on_schema_conflict() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        seed(backend.clone(), "pw");

        // Version 2 with no migration steps.
        let store = Store::builder("db", backend)
            .password("pw")
            .collection(tasks(2))
            .open_with_recovery(RecoveryMode::Development)
            .unwrap();
        assert_eq!(store.count("tasks").unwrap(), 0);
    }

    #[test]
    fn other_errors_are_not_recovered() {
        let manager = RecoveryManager::new(
            Arc::new(MemoryBackend::new()),
            "db",
            RecoveryMode::Development,
        );
        let calls = AtomicUsize::new(0);
        let result = manager.init_with_recovery(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Storage("disk full".into()))
        });
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn falls_back_to_wipe() {
        let backend = Arc::new(FlakyBackend {
            fail_remove: true,
            ..Default::default()
        });
        seed(backend.clone(), "old");

        let store = Store::builder("db", backend.clone())
            .password("new")
            .collection(tasks(0))
            .open_with_recovery(RecoveryMode::Development)
            .unwrap();
        assert_eq!(store.count("tasks").unwrap(), 0);
    }

    #[test]
    fn exhausted_recovery_lists_stages() {
        let backend = Arc::new(FlakyBackend {
            fail_remove: true,
            fail_wipe: true,
            ..Default::default()
        });
        seed(backend.clone(), "old");

        let result = Store::builder("db", backend)
            .password("new")
            .collection(tasks(0))
            .open_with_recovery(RecoveryMode::Development);
        match result {
            Err(Error::DatabaseRecovery { name, stages }) => {
                assert_eq!(name, "db");
                assert_eq!(stages.len(), 3);
                assert!(stages[0].starts_with("open:"));
                assert!(stages[1].starts_with("remove:"));
                assert!(stages[2].starts_with("delete_by_name:"));
            }
            other => panic!("expected DatabaseRecovery, got {other:?}"),
        }
    }

    #[test]
    fn parse_mode() {
        assert_eq!("development".parse(), Ok(RecoveryMode::Development));
        assert_eq!("PROD".parse(), Ok(RecoveryMode::Production));
        assert!("staging".parse::<RecoveryMode>().is_err());
        assert_eq!(RecoveryMode::default(), RecoveryMode::Production);
    }
}
