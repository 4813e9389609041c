//! Store - the durable document container.
//!
//! A [`Store`] owns every collection of one named store: documents, schema
//! metadata, replication checkpoints and the optional field cipher. Handles
//! are cheap to clone and safe to share between threads; every clone sees
//! the same state.
//!
//! Writes are persisted through the [`StorageBackend`] while the write lock
//! is held, so a successful return means the change is durable. A failed
//! persist rolls the in-memory change back.

use crate::{
    checkpoint::Checkpoint,
    clock::{MonotonicClock, SystemTime, TimeSource},
    crypto::FieldCipher,
    document::{strip_reserved, Metadata, Origin},
    error::Result,
    migration::{self, CollectionMetadataRecord, MigrationPlan},
    observe::{self, ChangeEvent, ChangeKind},
    reconcile::{MergeStrategy, Resolution},
    schema::{CollectionSchema, Model},
    snapshot::{CollectionSnapshot, StoreHeader, HEADER_KEY},
    storage::StorageBackend,
    CollectionName, Document, DocumentId, Error, Revision,
};
use futures::stream::BoxStream;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Attempts an optimistic update makes before giving up.
pub const MAX_UPDATE_ATTEMPTS: usize = 32;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Outcome of [`Store::apply_remote`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteApply {
    /// Documents written locally, in input order
    pub applied: Vec<DocumentId>,
    /// Subset of `applied` whose unpushed local edits were replaced
    pub overwritten_pending: Vec<DocumentId>,
    /// Documents already at the incoming remote revision
    pub unchanged: Vec<DocumentId>,
    /// Documents refused by validation, with the reason
    pub rejected: Vec<(DocumentId, String)>,
}

/// Acknowledgement of a pushed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAck {
    pub id: DocumentId,
    /// Local revision that was pushed
    pub revision: Revision,
    /// Revision token the remote assigned, if reported
    pub remote_rev: Option<String>,
}

/// Configures and opens a [`Store`].
///
/// The builder is cheap to clone, which lets recovery call the same open
/// routine more than once.
#[derive(Clone)]
pub struct StoreBuilder {
    name: String,
    backend: Arc<dyn StorageBackend>,
    password: Option<String>,
    schemas: Vec<CollectionSchema>,
    time: Arc<dyn TimeSource>,
}

impl fmt::Debug for StoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("encrypted", &self.password.is_some())
            .field(
                "collections",
                &self.schemas.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl StoreBuilder {
    pub fn new(name: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            password: None,
            schemas: Vec::new(),
            time: Arc::new(SystemTime),
        }
    }

    /// Encrypt designated fields with a key derived from `password`.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn password_opt(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Register a collection to open (and migrate) with the store.
    pub fn collection(mut self, schema: CollectionSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Register the collection bound to `T`.
    pub fn model<T: Model>(self) -> Self {
        self.collection(T::schema())
    }

    pub fn time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Open the store, unlocking or creating its encryption and bringing
    /// every registered collection to its current schema version.
    ///
    /// # Errors
    ///
    /// - [`Error::CredentialMismatch`] if the passphrase does not unlock the
    ///   store, or the store is encrypted and no passphrase was given.
    /// - [`Error::SchemaConflict`] if a persisted collection cannot be
    ///   opened with its registered schema.
    pub fn open(self) -> Result<Store> {
        let StoreBuilder {
            name,
            backend,
            password,
            schemas,
            time,
        } = self;

        let mut header = match backend.read(&name, HEADER_KEY)? {
            Some(bytes) => StoreHeader::from_bytes(&bytes)?,
            None => StoreHeader::new(),
        };

        let sealed_at_rest = header.encryption.is_some();
        let cipher = match (&header.encryption, password.as_deref()) {
            (Some(encryption), Some(password)) => Some(FieldCipher::unlock(password, encryption)?),
            (Some(_), None) => {
                return Err(Error::CredentialMismatch(format!(
                    "store '{name}' is encrypted but no passphrase was supplied"
                )))
            }
            (None, Some(password)) => {
                let (cipher, encryption) = FieldCipher::create(password)?;
                header.encryption = Some(encryption);
                info!(store = %name, "Enabled field encryption");
                Some(cipher)
            }
            (None, None) => None,
        };

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let inner = Inner {
            name,
            backend,
            cipher,
            sealed_at_rest,
            time,
            state: RwLock::new(State {
                header,
                clock: MonotonicClock::new(),
                collections: HashMap::new(),
                destroyed: false,
            }),
            changes,
        };

        {
            let mut state = inner.state.write();
            for schema in schemas {
                inner.register(&mut state, schema)?;
            }
            inner.persist_header(&state.header)?;
            info!(
                store = %inner.name,
                collections = state.collections.len(),
                encrypted = inner.cipher.is_some(),
                "Opened store"
            );
        }

        Ok(Store {
            inner: Arc::new(inner),
        })
    }
}

/// Handle to an open store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .field("encrypted", &self.inner.cipher.is_some())
            .finish_non_exhaustive()
    }
}

struct Inner {
    name: String,
    backend: Arc<dyn StorageBackend>,
    cipher: Option<FieldCipher>,
    /// The header recorded encryption before this open. Only then can
    /// collection files hold sealed values.
    sealed_at_rest: bool,
    time: Arc<dyn TimeSource>,
    state: RwLock<State>,
    changes: broadcast::Sender<ChangeEvent>,
}

struct State {
    header: StoreHeader,
    clock: MonotonicClock,
    collections: HashMap<CollectionName, CollectionState>,
    destroyed: bool,
}

struct CollectionState {
    schema: CollectionSchema,
    documents: BTreeMap<DocumentId, Document>,
}

impl State {
    fn check_live(&self) -> Result<()> {
        if self.destroyed {
            Err(Error::Storage("store has been destroyed".into()))
        } else {
            Ok(())
        }
    }

    fn collection(&self, name: &str) -> Result<&CollectionState> {
        self.check_live()?;
        self.collections
            .get(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }
}

fn collection_mut<'a>(
    collections: &'a mut HashMap<CollectionName, CollectionState>,
    name: &str,
) -> Result<&'a mut CollectionState> {
    collections
        .get_mut(name)
        .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
}

impl Inner {
    fn register(&self, state: &mut State, schema: CollectionSchema) -> Result<()> {
        let name = schema.name().clone();
        if name.is_empty() || name.starts_with('_') {
            return Err(Error::InvalidPayload(format!(
                "collection name '{name}' is reserved"
            )));
        }
        if let Some(existing) = state.collections.get(&name) {
            if existing.schema.shape() == schema.shape() {
                return Ok(());
            }
            return Err(Error::SchemaConflict {
                collection: name,
                reason: "collection is already registered with a different schema".into(),
            });
        }

        let (current, tombstoned) = migration::dedupe(&mut state.header.metadata, &name);
        let plan = migration::plan(&schema, current.as_ref())?;
        let mut documents = self.load_documents(&schema, current.as_ref())?;
        for doc in documents.values() {
            state.clock.observe(doc.metadata.updated_at);
        }

        let migrated = migrate_documents(&schema, &mut documents)?;
        if let MigrationPlan::Upgrade { from } = plan {
            info!(
                collection = %name,
                from,
                to = schema.current_version(),
                migrated,
                "Migrated collection"
            );
        }

        let collection = CollectionState { schema, documents };
        // Plaintext left by an unencrypted store is sealed as soon as a
        // passphrase is adopted.
        let reseal = self.cipher.is_some()
            && !self.sealed_at_rest
            && !collection.schema.encrypted_fields().is_empty()
            && !collection.documents.is_empty();
        if migrated > 0 || reseal {
            self.persist_collection(&collection)?;
        }

        let record_needed = plan != MigrationPlan::UpToDate;
        if record_needed {
            migration::supersede(&mut state.header.metadata, &name);
            let at = state.clock.tick(self.time.now_millis());
            state.header.metadata.push(CollectionMetadataRecord::new(
                collection.schema.shape().clone(),
                at,
            ));
        }
        if record_needed || tombstoned > 0 {
            self.persist_header(&state.header)?;
        }

        debug!(
            store = %self.name,
            collection = %name,
            documents = collection.documents.len(),
            "Registered collection"
        );
        state.collections.insert(name, collection);
        Ok(())
    }

    fn load_documents(
        &self,
        schema: &CollectionSchema,
        current: Option<&CollectionMetadataRecord>,
    ) -> Result<BTreeMap<DocumentId, Document>> {
        let Some(bytes) = self.backend.read(&self.name, schema.name())? else {
            return Ok(BTreeMap::new());
        };
        let mut snapshot = CollectionSnapshot::from_bytes(schema.name(), &bytes)?;

        // Fields sealed under an older shape must still be opened.
        let mut encrypted = schema.encrypted_fields().to_vec();
        if let Some(record) = current {
            for field in &record.shape.encrypted {
                if !encrypted.contains(field) {
                    encrypted.push(field.clone());
                }
            }
        }
        let cipher = match &self.cipher {
            Some(cipher) if self.sealed_at_rest && !encrypted.is_empty() => cipher,
            _ => return Ok(snapshot.documents),
        };
        for doc in snapshot.documents.values_mut() {
            cipher.open_fields(&mut doc.fields, &encrypted)?;
        }
        Ok(snapshot.documents)
    }

    fn persist_collection(&self, collection: &CollectionState) -> Result<()> {
        let encrypted = collection.schema.encrypted_fields();
        let bytes = match &self.cipher {
            Some(cipher) if !encrypted.is_empty() => {
                let mut sealed = collection.documents.clone();
                for doc in sealed.values_mut() {
                    cipher.seal_fields(&mut doc.fields, encrypted)?;
                }
                CollectionSnapshot::encode(&sealed)?
            }
            _ => CollectionSnapshot::encode(&collection.documents)?,
        };
        self.backend
            .write(&self.name, collection.schema.name(), &bytes)
    }

    fn persist_header(&self, header: &StoreHeader) -> Result<()> {
        self.backend.write(&self.name, HEADER_KEY, &header.to_bytes()?)
    }

    /// Stage `docs` into `target` and persist, restoring the previous
    /// documents if the write fails.
    fn commit(&self, target: &mut CollectionState, docs: Vec<Document>) -> Result<()> {
        let mut previous = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc.id.clone();
            let old = target.documents.insert(id.clone(), doc);
            previous.push((id, old));
        }

        if let Err(e) = self.persist_collection(target) {
            for (id, old) in previous.into_iter().rev() {
                match old {
                    Some(doc) => target.documents.insert(id, doc),
                    None => target.documents.remove(&id),
                };
            }
            error!(
                store = %self.name,
                collection = %target.schema.name(),
                error = %e,
                "Failed to persist collection, change rolled back"
            );
            return Err(e);
        }
        Ok(())
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            // No receivers is fine.
            self.changes.send(event).ok();
        }
    }
}

/// Bring documents below the schema version up to it. Returns how many
/// documents changed.
fn migrate_documents(
    schema: &CollectionSchema,
    documents: &mut BTreeMap<DocumentId, Document>,
) -> Result<usize> {
    let target = schema.current_version();
    let mut migrated = 0;
    for doc in documents.values_mut() {
        if doc.metadata.schema_version >= target {
            continue;
        }
        let fields = std::mem::take(&mut doc.fields);
        let mut fields = schema
            .migrate(fields, doc.metadata.schema_version)
            .map_err(|e| Error::SchemaConflict {
                collection: schema.name().clone(),
                reason: e.to_string(),
            })?;
        strip_reserved(&mut fields, schema.primary_key_field());
        if doc.is_active() {
            schema
                .validate_payload(&fields)
                .map_err(|e| Error::SchemaConflict {
                    collection: schema.name().clone(),
                    reason: format!("document '{}' is invalid after migration: {e}", doc.id),
                })?;
        }
        doc.fields = fields;
        doc.metadata.schema_version = target;
        migrated += 1;
    }
    Ok(migrated)
}

impl Store {
    pub fn builder(name: impl Into<String>, backend: Arc<dyn StorageBackend>) -> StoreBuilder {
        StoreBuilder::new(name, backend)
    }

    /// Open a store without registering collections up front.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        name: impl Into<String>,
        password: Option<&str>,
    ) -> Result<Store> {
        StoreBuilder::new(name, backend)
            .password_opt(password.map(str::to_string))
            .open()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.cipher.is_some()
    }

    /// Registered collection names, sorted.
    pub fn collections(&self) -> Vec<CollectionName> {
        let state = self.inner.state.read();
        let mut names: Vec<_> = state.collections.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn schema(&self, collection: &str) -> Result<CollectionSchema> {
        let state = self.inner.state.read();
        Ok(state.collection(collection)?.schema.clone())
    }

    /// Register a collection on an open store, migrating its persisted
    /// documents. Registering the same schema twice is a no-op.
    pub fn add_collection(&self, schema: CollectionSchema) -> Result<()> {
        let mut state = self.inner.state.write();
        state.check_live()?;
        self.inner.register(&mut state, schema)
    }

    /// Get a live document.
    pub fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let state = self.inner.state.read();
        Ok(state
            .collection(collection)?
            .documents
            .get(id)
            .filter(|d| d.is_active())
            .cloned())
    }

    /// Get a document even if it is a tombstone.
    pub fn get_including_deleted(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let state = self.inner.state.read();
        Ok(state.collection(collection)?.documents.get(id).cloned())
    }

    /// Live documents matching `predicate`, ordered by id.
    pub fn find<F>(&self, collection: &str, predicate: F) -> Result<Vec<Document>>
    where
        F: Fn(&Document) -> bool,
    {
        let state = self.inner.state.read();
        Ok(state
            .collection(collection)?
            .documents
            .values()
            .filter(|d| d.is_active() && predicate(d))
            .cloned()
            .collect())
    }

    /// All live documents, ordered by id.
    pub fn all(&self, collection: &str) -> Result<Vec<Document>> {
        self.find(collection, |_| true)
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        let state = self.inner.state.read();
        Ok(state
            .collection(collection)?
            .documents
            .values()
            .filter(|d| d.is_active())
            .count())
    }

    /// Stream of one document: the current value first, then the new value
    /// after every change to it. `None` while the document does not exist.
    pub fn observe(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<BoxStream<'static, Option<Document>>> {
        self.inner.state.read().collection(collection)?;
        Ok(observe::document_stream(
            self.clone(),
            collection.to_string(),
            id.to_string(),
        ))
    }

    /// Stream of all live documents of a collection, re-emitted after every
    /// change to it.
    pub fn observe_all(&self, collection: &str) -> Result<BoxStream<'static, Vec<Document>>> {
        self.inner.state.read().collection(collection)?;
        Ok(observe::collection_stream(
            self.clone(),
            collection.to_string(),
        ))
    }

    /// Raw change events for every collection.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes.subscribe()
    }

    /// Insert a document from a JSON object.
    ///
    /// The primary key is read from the object, or generated when absent or
    /// empty.
    /// `createdAt`/`updatedAt` are always set by the store. Inserting over a
    /// tombstone revives it.
    pub fn insert(&self, collection: &str, value: Value) -> Result<Document> {
        let Value::Object(mut fields) = value else {
            return Err(Error::InvalidPayload("document must be a JSON object".into()));
        };

        let doc = {
            let mut guard = self.inner.state.write();
            guard.check_live()?;
            let State {
                clock, collections, ..
            } = &mut *guard;
            let target = collection_mut(collections, collection)?;
            let pk = target.schema.primary_key_field().to_string();

            let id = match fields.get(&pk) {
                Some(Value::String(id)) if !id.is_empty() => id.clone(),
                None | Some(Value::Null) | Some(Value::String(_)) => {
                    uuid::Uuid::new_v4().to_string()
                }
                Some(other) => {
                    return Err(Error::InvalidPayload(format!(
                        "primary key '{pk}' must be a non-empty string, got {other}"
                    )))
                }
            };
            strip_reserved(&mut fields, &pk);
            target.schema.validate_payload(&fields)?;

            let now = clock.tick(self.inner.time.now_millis());
            let version = target.schema.current_version();
            let doc = match target.documents.get(&id) {
                Some(existing) if existing.is_active() => {
                    return Err(Error::DocumentAlreadyExists(id))
                }
                Some(tombstone) => {
                    let mut revived = tombstone.clone();
                    revived.deleted = false;
                    revived.metadata.created_at = now;
                    revived.metadata.schema_version = version;
                    revived.write_fields(fields, now, Origin::Local);
                    revived
                }
                None => Document::new_local(id, fields, now, version),
            };
            self.inner.commit(target, vec![doc.clone()])?;
            doc
        };

        debug!(collection, id = %doc.id, "Inserted document");
        self.inner.publish(vec![ChangeEvent {
            collection: collection.to_string(),
            id: doc.id.clone(),
            kind: ChangeKind::Insert,
            origin: Origin::Local,
        }]);
        Ok(doc)
    }

    /// Atomic read-modify-write of a live document.
    ///
    /// `mutator` receives the current fields and returns the new ones. It
    /// runs without any lock held and may be called more than once: the
    /// result only commits if the document has not changed since it was
    /// read, otherwise the update starts over with the fresh document.
    ///
    /// # Errors
    ///
    /// [`Error::UpdateContention`] after [`MAX_UPDATE_ATTEMPTS`] lost races.
    pub fn update<F>(&self, collection: &str, id: &str, mutator: F) -> Result<Document>
    where
        F: Fn(Map<String, Value>) -> Map<String, Value>,
    {
        self.update_with(collection, id, |doc| Ok(mutator(doc.fields.clone())))
    }

    pub(crate) fn update_with<F>(&self, collection: &str, id: &str, mutator: F) -> Result<Document>
    where
        F: Fn(&Document) -> Result<Map<String, Value>>,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = self
                .get(collection, id)?
                .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;
            let mut fields = mutator(&current)?;

            let doc = {
                let mut guard = self.inner.state.write();
                guard.check_live()?;
                let State {
                    clock, collections, ..
                } = &mut *guard;
                let target = collection_mut(collections, collection)?;
                let latest = target
                    .documents
                    .get(id)
                    .filter(|d| d.is_active())
                    .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;

                if latest.metadata.revision != current.metadata.revision {
                    debug!(collection, id, attempt, "Update raced another write, retrying");
                    continue;
                }

                strip_reserved(&mut fields, target.schema.primary_key_field());
                target.schema.validate_payload(&fields)?;

                let now = clock.tick(self.inner.time.now_millis());
                let mut next = latest.clone();
                next.metadata.schema_version = target.schema.current_version();
                next.write_fields(fields, now, Origin::Local);
                self.inner.commit(target, vec![next.clone()])?;
                next
            };

            debug!(collection, id, revision = doc.metadata.revision, "Updated document");
            self.inner.publish(vec![ChangeEvent {
                collection: collection.to_string(),
                id: id.to_string(),
                kind: ChangeKind::Update,
                origin: Origin::Local,
            }]);
            return Ok(doc);
        }

        warn!(collection, id, attempts = MAX_UPDATE_ATTEMPTS, "Update gave up after repeated races");
        Err(Error::UpdateContention {
            id: id.to_string(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    /// Tombstone a document. Removing a missing or already deleted document
    /// does nothing.
    pub fn remove(&self, collection: &str, id: &str) -> Result<()> {
        {
            let mut guard = self.inner.state.write();
            guard.check_live()?;
            let State {
                clock, collections, ..
            } = &mut *guard;
            let target = collection_mut(collections, collection)?;
            let Some(existing) = target.documents.get(id).filter(|d| d.is_active()) else {
                debug!(collection, id, "Remove of missing document ignored");
                return Ok(());
            };

            let now = clock.tick(self.inner.time.now_millis());
            let mut tombstone = existing.clone();
            tombstone.mark_deleted(now, Origin::Local);
            self.inner.commit(target, vec![tombstone])?;
        }

        debug!(collection, id, "Removed document");
        self.inner.publish(vec![ChangeEvent {
            collection: collection.to_string(),
            id: id.to_string(),
            kind: ChangeKind::Delete,
            origin: Origin::Local,
        }]);
        Ok(())
    }

    /// Local writes the remote has not acknowledged yet, tombstones
    /// included, oldest first.
    pub fn pending_changes(&self, collection: &str, limit: usize) -> Result<Vec<Document>> {
        let state = self.inner.state.read();
        let mut pending: Vec<_> = state
            .collection(collection)?
            .documents
            .values()
            .filter(|d| d.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.metadata
                .updated_at
                .cmp(&b.metadata.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    /// Record that `revision` of a document reached the remote. Returns
    /// `false` if the document has been written again since.
    pub fn mark_synced(&self, collection: &str, id: &str, revision: Revision) -> Result<bool> {
        let acked = self.mark_synced_batch(
            collection,
            &[SyncAck {
                id: id.to_string(),
                revision,
                remote_rev: None,
            }],
        )?;
        Ok(acked == 1)
    }

    /// Record a batch of acknowledgements with a single write. Returns how
    /// many documents were still at the acknowledged revision.
    ///
    /// A document written again while its push was in flight stays pending,
    /// but still takes the acknowledged remote revision so the echo of that
    /// push is recognised on the next pull and the following push carries
    /// the right `_rev`.
    pub fn mark_synced_batch(&self, collection: &str, acks: &[SyncAck]) -> Result<usize> {
        let mut guard = self.inner.state.write();
        guard.check_live()?;
        let target = collection_mut(&mut guard.collections, collection)?;

        let mut updated = Vec::new();
        let mut synced = 0;
        for ack in acks {
            let Some(doc) = target.documents.get(&ack.id) else {
                continue;
            };
            let mut doc = doc.clone();
            if doc.metadata.revision == ack.revision {
                doc.metadata.synced_revision = Some(ack.revision);
                synced += 1;
            } else {
                debug!(
                    collection,
                    id = %ack.id,
                    acked = ack.revision,
                    current = doc.metadata.revision,
                    "Document changed while in flight, stays pending"
                );
                if ack.remote_rev.is_none() || ack.remote_rev == doc.metadata.remote_rev {
                    continue;
                }
            }
            if ack.remote_rev.is_some() {
                doc.metadata.remote_rev = ack.remote_rev.clone();
            }
            updated.push(doc);
        }

        if !updated.is_empty() {
            self.inner.commit(target, updated)?;
        }
        Ok(synced)
    }

    /// Write documents received from the remote. The remote is
    /// authoritative: incoming content replaces local content, including
    /// local edits that have not been pushed yet (reported in
    /// [`RemoteApply::overwritten_pending`]).
    ///
    /// A document whose remote revision token matches the one already held
    /// is an echo of what the store has and is skipped.
    pub fn apply_remote(&self, collection: &str, docs: Vec<Document>) -> Result<RemoteApply> {
        self.write_remote(collection, docs, true)
    }

    fn write_remote(
        &self,
        collection: &str,
        docs: Vec<Document>,
        skip_echoes: bool,
    ) -> Result<RemoteApply> {
        let mut report = RemoteApply::default();
        let mut events = Vec::new();

        {
            let mut guard = self.inner.state.write();
            guard.check_live()?;
            let State {
                clock, collections, ..
            } = &mut *guard;
            let target = collection_mut(collections, collection)?;
            let pk = target.schema.primary_key_field().to_string();
            let version = target.schema.current_version();

            let mut staged: BTreeMap<DocumentId, Document> = BTreeMap::new();
            for remote in docs {
                let mut fields = remote.fields;
                strip_reserved(&mut fields, &pk);
                if !remote.deleted {
                    if let Err(e) = target.schema.validate_payload(&fields) {
                        warn!(collection, id = %remote.id, error = %e, "Rejected invalid remote document");
                        report.rejected.push((remote.id, e.to_string()));
                        continue;
                    }
                }

                let existing = staged
                    .get(&remote.id)
                    .or_else(|| target.documents.get(&remote.id))
                    .cloned();

                if let Some(existing) = &existing {
                    let same_rev = skip_echoes
                        && existing.metadata.remote_rev.is_some()
                        && existing.metadata.remote_rev == remote.metadata.remote_rev;
                    if same_rev {
                        report.unchanged.push(remote.id);
                        continue;
                    }
                }

                let timestamp = if remote.metadata.updated_at > 0 {
                    remote.metadata.updated_at
                } else {
                    clock.tick(self.inner.time.now_millis())
                };
                clock.observe(timestamp);

                let (doc, kind) = match existing {
                    Some(mut doc) => {
                        if doc.is_pending() {
                            report.overwritten_pending.push(doc.id.clone());
                        }
                        let kind = match (doc.deleted, remote.deleted) {
                            (_, true) => ChangeKind::Delete,
                            (true, false) => ChangeKind::Insert,
                            (false, false) => ChangeKind::Update,
                        };
                        if remote.deleted {
                            doc.mark_deleted(timestamp, Origin::Remote);
                        } else {
                            doc.deleted = false;
                            doc.write_fields(fields, timestamp, Origin::Remote);
                        }
                        doc.metadata.schema_version = version;
                        doc.metadata.synced_revision = Some(doc.metadata.revision);
                        doc.metadata.remote_rev = remote.metadata.remote_rev;
                        (doc, kind)
                    }
                    None => {
                        let created_at = match remote.metadata.created_at {
                            0 => timestamp,
                            at => at,
                        };
                        let doc = Document {
                            id: remote.id,
                            fields,
                            metadata: Metadata {
                                created_at,
                                updated_at: timestamp,
                                revision: 1,
                                schema_version: version,
                                origin: Origin::Remote,
                                synced_revision: Some(1),
                                remote_rev: remote.metadata.remote_rev,
                            },
                            deleted: remote.deleted,
                        };
                        let kind = if doc.deleted {
                            ChangeKind::Delete
                        } else {
                            ChangeKind::Insert
                        };
                        (doc, kind)
                    }
                };

                report.applied.push(doc.id.clone());
                events.push(ChangeEvent {
                    collection: collection.to_string(),
                    id: doc.id.clone(),
                    kind,
                    origin: Origin::Remote,
                });
                staged.insert(doc.id.clone(), doc);
            }

            if !staged.is_empty() {
                self.inner.commit(target, staged.into_values().collect())?;
            }
        }

        if !report.overwritten_pending.is_empty() {
            warn!(
                collection,
                ids = ?report.overwritten_pending,
                "Remote documents replaced unpushed local edits"
            );
        }
        debug!(
            collection,
            applied = report.applied.len(),
            unchanged = report.unchanged.len(),
            rejected = report.rejected.len(),
            "Applied remote documents"
        );
        self.inner.publish(events);
        Ok(report)
    }

    /// Resolve a push conflict between the local document and the
    /// authoritative `remote` one.
    ///
    /// When the remote side wins it is applied like a pulled document. When
    /// the local side wins its content is untouched and stays pending; only
    /// the remote revision it won against is recorded, so a pull of that
    /// same revision does not overwrite it before the next push.
    pub fn resolve_conflict(
        &self,
        collection: &str,
        remote: Document,
        strategy: MergeStrategy,
    ) -> Result<Resolution> {
        let local = self.get_including_deleted(collection, &remote.id)?;
        let resolution = strategy.decide(local.as_ref(), &remote);
        debug!(collection, id = %remote.id, ?strategy, ?resolution, "Resolved conflict");
        match resolution {
            Resolution::TookRemote => {
                self.write_remote(collection, vec![remote], false)?;
            }
            Resolution::KeptLocal => {
                if let Some(rev) = remote.metadata.remote_rev {
                    self.note_remote_rev(collection, &remote.id, rev)?;
                }
            }
        }
        Ok(resolution)
    }

    fn note_remote_rev(&self, collection: &str, id: &str, rev: String) -> Result<()> {
        let mut guard = self.inner.state.write();
        guard.check_live()?;
        let target = collection_mut(&mut guard.collections, collection)?;
        let Some(doc) = target.documents.get(id) else {
            return Ok(());
        };
        let mut doc = doc.clone();
        doc.metadata.remote_rev = Some(rev);
        self.inner.commit(target, vec![doc])
    }

    /// Last checkpoint durably reached for `collection`.
    pub fn checkpoint(&self, collection: &str) -> Result<Checkpoint> {
        let state = self.inner.state.read();
        state.collection(collection)?;
        Ok(state
            .header
            .checkpoints
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    /// Move the checkpoint forward. A checkpoint behind the current one is
    /// ignored; the returned value is the checkpoint now in effect.
    pub fn advance_checkpoint(&self, collection: &str, next: Checkpoint) -> Result<Checkpoint> {
        let mut guard = self.inner.state.write();
        guard.collection(collection)?;

        let current = guard
            .header
            .checkpoints
            .get(collection)
            .cloned()
            .unwrap_or_default();
        if !current.allows_advance_to(&next) {
            warn!(collection, %current, %next, "Refused to move checkpoint backwards");
            return Ok(current);
        }

        let previous = guard
            .header
            .checkpoints
            .insert(collection.to_string(), next.clone());
        if let Err(e) = self.inner.persist_header(&guard.header) {
            match previous {
                Some(cp) => guard.header.checkpoints.insert(collection.to_string(), cp),
                None => guard.header.checkpoints.remove(collection),
            };
            return Err(e);
        }
        debug!(collection, checkpoint = %next, "Advanced checkpoint");
        Ok(next)
    }

    /// Delete everything this store persisted. The handle (and every
    /// clone) is unusable afterwards.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        state.check_live()?;
        state.destroyed = true;
        state.collections.clear();

        let backend = &self.inner.backend;
        for key in backend.keys(&self.inner.name)? {
            backend.remove(&self.inner.name, &key)?;
        }
        backend.delete_by_name(&self.inner.name)?;
        info!(store = %self.inner.name, "Destroyed store");
        Ok(())
    }

    /// Remove a store that is not open, through its own layout.
    ///
    /// Every collection file named by the header is read back before
    /// anything is deleted, so a store whose data cannot be parsed is left
    /// untouched and the error returned.
    pub fn remove_store(backend: &dyn StorageBackend, name: &str) -> Result<()> {
        let collections = match backend.read(name, HEADER_KEY)? {
            Some(bytes) => StoreHeader::from_bytes(&bytes)?.collection_names(),
            None => Vec::new(),
        };
        for collection in &collections {
            if let Some(bytes) = backend.read(name, collection)? {
                CollectionSnapshot::from_bytes(collection, &bytes)?;
            }
        }

        for collection in &collections {
            backend.remove(name, collection)?;
        }
        backend.remove(name, HEADER_KEY)?;
        for key in backend.keys(name)? {
            backend.remove(name, &key)?;
        }
        info!(store = name, collections = collections.len(), "Removed store");
        Ok(())
    }
}
