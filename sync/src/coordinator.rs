//! Session-scoped replication management.
//!
//! The coordinator is the only place engines are created and destroyed.
//! [`SyncCoordinator::start`] is called when a user session begins and
//! attaches one engine per collection to that user's databases;
//! [`SyncCoordinator::stop`] is called on logout or credential change.

use crate::auth::Credentials;
use crate::error::Result;
use crate::provision::RemoteProvisioner;
use crate::remote::CouchClient;
use crate::replication::{
    ConflictHandler, MergeResolver, ReplicationEngine, ReplicationEvent, ReplicationHandle,
    ReplicationOptions, ReplicationState,
};
use dashmap::DashMap;
use ferry_engine::{MergeStrategy, Store};
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

const EVENT_CAPACITY: usize = 1024;

/// Starts and stops replication for a user session.
///
/// Thread-safe and can be shared via `Arc`.
pub struct SyncCoordinator {
    store: Store,
    http: Client,
    db_prefix: String,
    options: ReplicationOptions,
    /// Collections to replicate; every registered one when unset
    collections: Option<Vec<String>>,
    conflict_handler: Arc<dyn ConflictHandler>,
    provisioner: Option<RemoteProvisioner>,
    /// Running engines, keyed by collection.
    engines: DashMap<String, ReplicationHandle>,
    events: broadcast::Sender<ReplicationEvent>,
    /// Serializes start and stop.
    lifecycle: Mutex<()>,
}

impl SyncCoordinator {
    /// Create a coordinator over `store`.
    pub fn new(store: Store) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            http: Client::new(),
            db_prefix: "userdb".to_string(),
            options: ReplicationOptions::default(),
            collections: None,
            conflict_handler: Arc::new(MergeResolver(MergeStrategy::default())),
            provisioner: None,
            engines: DashMap::new(),
            events,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_db_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.db_prefix = prefix.into();
        self
    }

    pub fn with_options(mut self, options: ReplicationOptions) -> Self {
        self.options = options;
        self
    }

    /// Replicate only these collections.
    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    /// Resolve conflicts with `strategy` (the default is
    /// [`MergeStrategy::LatestWins`]).
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.conflict_handler = Arc::new(MergeResolver(strategy));
        self
    }

    pub fn with_conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict_handler = handler;
        self
    }

    /// Create and secure the user's databases with `admin` before
    /// replication starts.
    pub fn with_provisioning(mut self, admin: Credentials) -> Self {
        self.provisioner = Some(RemoteProvisioner::new(self.http.clone(), admin));
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Remote database holding `collection` for `user_id`.
    pub fn database_name(&self, user_id: &str, collection: &str) -> String {
        format!("{}-{}-{}", self.db_prefix, user_id, collection)
    }

    /// Begin replicating every collection for `user_id`.
    ///
    /// Any running session is stopped first. Engines are only spawned once
    /// all of them could be built, so a failure leaves nothing running.
    pub async fn start(
        &self,
        user_id: &str,
        remote_url: &str,
        credentials: Credentials,
    ) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_engines().await;

        let collections = match &self.collections {
            Some(collections) => collections.clone(),
            None => self.store.collections(),
        };
        let databases: Vec<String> = collections
            .iter()
            .map(|collection| self.database_name(user_id, collection))
            .collect();

        if let Some(provisioner) = &self.provisioner {
            let created = provisioner
                .ensure_user_databases(remote_url, user_id, &databases)
                .await?;
            if !created.is_empty() {
                info!(user_id, databases = ?created, "Provisioned remote databases");
            }
        }

        let mut engines = Vec::with_capacity(collections.len());
        for (collection, db) in collections.iter().zip(&databases) {
            let remote = CouchClient::new(self.http.clone(), remote_url, db, credentials.clone())?;
            let engine = ReplicationEngine::new(
                self.store.clone(),
                collection,
                Arc::new(remote),
                self.options.clone(),
            )?
            .with_event_sender(self.events.clone())
            .with_conflict_handler(self.conflict_handler.clone());
            engines.push(engine);
        }

        for engine in engines {
            let collection = engine.collection().to_string();
            self.engines.insert(collection, engine.start());
        }

        info!(user_id, collections = self.engines.len(), "Sync started");
        Ok(())
    }

    /// Cancel every engine and wait for all of them. Safe to call when
    /// nothing is running.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_engines().await;
    }

    async fn stop_engines(&self) {
        let collections: Vec<String> = self.engines.iter().map(|e| e.key().clone()).collect();
        let handles: Vec<ReplicationHandle> = collections
            .iter()
            .filter_map(|collection| self.engines.remove(collection))
            .map(|(_, handle)| handle)
            .collect();
        if handles.is_empty() {
            return;
        }

        for handle in &handles {
            handle.cancel();
        }
        futures::future::join_all(handles.into_iter().map(ReplicationHandle::join)).await;
        info!(collections = collections.len(), "Sync stopped");
    }

    /// Run a cycle on every engine now.
    pub fn resync_all(&self) {
        for entry in self.engines.iter() {
            entry.value().resync();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.engines.is_empty()
    }

    pub fn state(&self, collection: &str) -> Option<ReplicationState> {
        self.engines.get(collection).map(|handle| handle.state())
    }

    /// State of every running engine, ordered by collection.
    pub fn states(&self) -> Vec<ReplicationState> {
        let mut states: Vec<_> = self.engines.iter().map(|e| e.value().state()).collect();
        states.sort_by(|a, b| a.collection.cmp(&b.collection));
        states
    }

    /// Events from every engine, across sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("store", &self.store.name())
            .field("db_prefix", &self.db_prefix)
            .field("options", &self.options)
            .field("running", &self.engines.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_engine::{CollectionSchema, MemoryBackend};

    fn store() -> Store {
        Store::builder("db", Arc::new(MemoryBackend::new()))
            .collection(CollectionSchema::new("tasks", vec![]))
            .collection(CollectionSchema::new("projects", vec![]))
            .open()
            .unwrap()
    }

    #[test]
    fn database_names() {
        let coordinator = SyncCoordinator::new(store());
        assert_eq!(coordinator.database_name("u1", "tasks"), "userdb-u1-tasks");

        let coordinator = coordinator.with_db_prefix("kernel");
        assert_eq!(coordinator.database_name("u1", "areas"), "kernel-u1-areas");
    }

    #[tokio::test]
    async fn stop_when_idle() {
        let coordinator = SyncCoordinator::new(store());
        coordinator.stop().await;
        assert!(!coordinator.is_running());
        assert!(coordinator.states().is_empty());
    }

    #[tokio::test]
    async fn unknown_collection_starts_nothing() {
        let coordinator = SyncCoordinator::new(store()).with_collections(["tasks", "missing"]);
        let result = coordinator
            .start("u1", "http://127.0.0.1:9", Credentials::None)
            .await;
        assert!(result.is_err());
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn bad_url_starts_nothing() {
        let coordinator = SyncCoordinator::new(store());
        let result = coordinator.start("u1", "not a url", Credentials::None).await;
        assert!(matches!(result, Err(crate::SyncError::InvalidUrl { .. })));
        assert!(!coordinator.is_running());
    }
}
