//! Per-collection replication.
//!
//! A [`ReplicationEngine`] moves one local collection and one remote
//! database towards each other. A cycle pulls the change feed from the
//! stored checkpoint, then pushes every pending local write. While live,
//! cycles repeat on a fixed interval; [`ReplicationEngine::resync`] runs
//! one immediately.
//!
//! Local state only changes through [`Store::apply_remote`] during pull and
//! through [`Store::mark_synced_batch`] after a push. Conflicting remote
//! documents are handed to a [`ConflictHandler`] and are never applied by
//! the engine itself.

use super::events::ReplicationEvent;
use super::state::{Phase, ReplicationState};
use crate::error::{Rejection, Result, SyncError};
use crate::protocol::{encode_document, is_design_document, BulkOutcome, ChangeRow};
use crate::remote::RemoteDatabase;
use ferry_engine::{
    Checkpoint, Document, DocumentId, MergeStrategy, Revision, Store, SyncAck,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Documents per request unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 60;

/// Delay between live cycles unless configured otherwise.
pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 256;

/// Replication tuning.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    /// Change feed rows per pull request and documents per push request
    pub batch_size: usize,
    pub pull_interval: Duration,
    /// Repeat cycles on the interval; otherwise only on [`ReplicationEngine::resync`]
    pub live: bool,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            pull_interval: DEFAULT_PULL_INTERVAL,
            live: true,
        }
    }
}

/// Receives the authoritative remote documents of push conflicts.
pub trait ConflictHandler: Send + Sync {
    fn resolve(
        &self,
        store: &Store,
        collection: &str,
        conflicts: Vec<Document>,
    ) -> ferry_engine::Result<()>;
}

impl<F> ConflictHandler for F
where
    F: Fn(&Store, &str, Vec<Document>) -> ferry_engine::Result<()> + Send + Sync,
{
    fn resolve(
        &self,
        store: &Store,
        collection: &str,
        conflicts: Vec<Document>,
    ) -> ferry_engine::Result<()> {
        self(store, collection, conflicts)
    }
}

/// Resolves every conflict with one [`MergeStrategy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeResolver(pub MergeStrategy);

impl ConflictHandler for MergeResolver {
    fn resolve(
        &self,
        store: &Store,
        collection: &str,
        conflicts: Vec<Document>,
    ) -> ferry_engine::Result<()> {
        for remote in conflicts {
            let id = remote.id.clone();
            let resolution = store.resolve_conflict(collection, remote, self.0)?;
            info!(collection, %id, ?resolution, strategy = ?self.0, "Conflict resolved");
        }
        Ok(())
    }
}

/// One page of the change feed, decoded but not yet applied.
#[derive(Debug, Clone, Default)]
pub struct PullBatch {
    pub documents: Vec<Document>,
    /// Checkpoint covering this page
    pub checkpoint: Checkpoint,
    /// Rows the remote returned, design documents included
    pub rows: usize,
}

/// Outcome of a pull.
#[derive(Debug, Clone, Default)]
pub struct PullReport {
    pub received: Vec<DocumentId>,
    /// Ids whose unpushed local edits were replaced
    pub overwritten: Vec<DocumentId>,
    /// Remote documents that failed validation
    pub rejected: Vec<(DocumentId, String)>,
    pub checkpoint: Checkpoint,
    pub batches: usize,
}

/// Outcome of a push.
#[derive(Debug, Clone, Default)]
pub struct PushReport {
    /// Ids acknowledged by the remote
    pub sent: Vec<DocumentId>,
    /// Authoritative remote versions of conflicting documents
    pub conflicts: Vec<Document>,
    /// Documents refused for any reason other than a conflict
    pub rejections: Vec<Rejection>,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub pull: PullReport,
    pub push: PushReport,
}

/// Replicates one collection with one remote database.
pub struct ReplicationEngine {
    collection: String,
    store: Store,
    remote: Arc<dyn RemoteDatabase>,
    options: ReplicationOptions,
    conflict_handler: Option<Arc<dyn ConflictHandler>>,
    state: watch::Sender<ReplicationState>,
    events: broadcast::Sender<ReplicationEvent>,
    cancel: CancellationToken,
    resync: Notify,
    /// Held for the whole of a cycle
    cycle: Mutex<()>,
}

impl ReplicationEngine {
    /// Engine for `collection`, resuming from its stored checkpoint.
    pub fn new(
        store: Store,
        collection: impl Into<String>,
        remote: Arc<dyn RemoteDatabase>,
        options: ReplicationOptions,
    ) -> Result<Self> {
        let collection = collection.into();
        let checkpoint = store.checkpoint(&collection)?;
        let (state, _) = watch::channel(ReplicationState::new(
            collection.clone(),
            remote.name(),
            checkpoint,
            options.live,
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            collection,
            store,
            remote,
            options: ReplicationOptions {
                batch_size: options.batch_size.max(1),
                ..options
            },
            conflict_handler: None,
            state,
            events,
            cancel: CancellationToken::new(),
            resync: Notify::new(),
            cycle: Mutex::new(()),
        })
    }

    pub fn with_conflict_handler(mut self, handler: Arc<dyn ConflictHandler>) -> Self {
        self.conflict_handler = Some(handler);
        self
    }

    /// Publish events on a shared channel instead of a private one.
    pub fn with_event_sender(mut self, events: broadcast::Sender<ReplicationEvent>) -> Self {
        self.events = events;
        self
    }

    /// Cancel together with `parent`.
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ReplicationState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ReplicationState> {
        self.state.subscribe()
    }

    /// Stop for good. A cycle in progress is abandoned at its next network
    /// call; local writes it already made stay.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.set_phase(Phase::Stopped);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a cycle now instead of waiting for the next tick.
    pub fn resync(&self) {
        self.resync.notify_one();
    }

    /// Fetch one page of changes after `since`.
    pub async fn pull_batch(&self, since: &Checkpoint) -> Result<PullBatch> {
        let changes = self
            .remote
            .changes(since, self.options.batch_size)
            .await
            .map_err(|e| self.pull_failure(e))?;

        let rows = changes.results.len();
        let documents = changes
            .results
            .into_iter()
            .filter(|row| !is_design_document(&row.id))
            .filter_map(ChangeRow::into_document)
            .collect();
        let checkpoint = if changes.last_seq.is_null() {
            since.clone()
        } else {
            Checkpoint::new(changes.last_seq)
        };

        Ok(PullBatch {
            documents,
            checkpoint,
            rows,
        })
    }

    /// Pull pages until the remote returns a short one. Each page is
    /// applied before the checkpoint moves past it.
    pub async fn pull(&self) -> Result<PullReport> {
        let mut report = PullReport {
            checkpoint: self.store.checkpoint(&self.collection)?,
            ..Default::default()
        };

        loop {
            let batch = self.pull_batch(&report.checkpoint).await?;
            let applied = self.store.apply_remote(&self.collection, batch.documents)?;
            let checkpoint = self
                .store
                .advance_checkpoint(&self.collection, batch.checkpoint)?;
            report.batches += 1;

            let progressed = checkpoint != report.checkpoint;
            report.checkpoint = checkpoint.clone();
            self.state.send_modify(|state| state.checkpoint = checkpoint.clone());

            if !applied.applied.is_empty() {
                debug!(
                    collection = %self.collection,
                    count = applied.applied.len(),
                    %checkpoint,
                    "Pulled documents"
                );
                self.emit(ReplicationEvent::Received {
                    collection: self.collection.clone(),
                    ids: applied.applied.clone(),
                    checkpoint,
                });
            }
            if !applied.overwritten_pending.is_empty() {
                self.emit(ReplicationEvent::LocalOverwritten {
                    collection: self.collection.clone(),
                    ids: applied.overwritten_pending.clone(),
                });
            }
            report.received.extend(applied.applied);
            report.overwritten.extend(applied.overwritten_pending);
            report.rejected.extend(applied.rejected);

            if batch.rows < self.options.batch_size || !progressed {
                break;
            }
        }

        Ok(report)
    }

    /// Send `pending` in one `_bulk_docs` request.
    ///
    /// Documents the remote already has carry its current revision. Local
    /// tombstones the remote never saw are acknowledged without being
    /// sent. Conflicting documents are fetched and returned; other
    /// refusals are returned as rejections and stay pending.
    pub async fn push(&self, pending: Vec<Document>) -> Result<PushReport> {
        let mut report = PushReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let ids: Vec<String> = pending.iter().map(|doc| doc.id.clone()).collect();
        let revisions = self.remote.revisions(&ids).await?;

        let mut acks = Vec::new();
        let mut outgoing = Vec::new();
        let mut in_flight: HashMap<&str, Revision> = HashMap::new();
        for doc in &pending {
            let rev = revisions.get(&doc.id).map(String::as_str);
            if doc.deleted && rev.is_none() {
                acks.push(SyncAck {
                    id: doc.id.clone(),
                    revision: doc.metadata.revision,
                    remote_rev: None,
                });
                continue;
            }
            outgoing.push(encode_document(doc, rev));
            in_flight.insert(&doc.id, doc.metadata.revision);
        }

        let mut conflicted = Vec::new();
        if !outgoing.is_empty() {
            let results = self.remote.bulk_docs(outgoing).await?;
            for result in results {
                match result.outcome() {
                    BulkOutcome::Saved { rev } => {
                        if let Some(&revision) = in_flight.get(result.id.as_str()) {
                            acks.push(SyncAck {
                                id: result.id,
                                revision,
                                remote_rev: rev,
                            });
                        }
                    }
                    BulkOutcome::Conflict => conflicted.push(result.id),
                    BulkOutcome::Rejected { error, reason } => {
                        warn!(
                            collection = %self.collection,
                            id = %result.id,
                            %error,
                            %reason,
                            "Remote rejected document"
                        );
                        report.rejections.push(Rejection {
                            id: result.id,
                            error,
                            reason,
                        });
                    }
                }
            }
        }

        if !acks.is_empty() {
            self.store.mark_synced_batch(&self.collection, &acks)?;
            report.sent = acks.into_iter().map(|ack| ack.id).collect();
            debug!(collection = %self.collection, count = report.sent.len(), "Pushed documents");
            self.emit(ReplicationEvent::Sent {
                collection: self.collection.clone(),
                ids: report.sent.clone(),
            });
        }

        if !conflicted.is_empty() {
            warn!(collection = %self.collection, ids = ?conflicted, "Push conflicts");
            report.conflicts = self.fetch_conflicts(&conflicted).await?;
            self.emit(ReplicationEvent::Conflict {
                collection: self.collection.clone(),
                ids: conflicted,
            });
        }

        Ok(report)
    }

    /// Push every pending local write in batches.
    ///
    /// A batch with rejections ends the push; later batches wait for the
    /// next cycle.
    pub async fn push_pending(&self) -> Result<PushReport> {
        let pending = self.store.pending_changes(&self.collection, usize::MAX)?;
        let mut total = PushReport::default();
        for chunk in pending.chunks(self.options.batch_size) {
            let report = self.push(chunk.to_vec()).await?;
            total.sent.extend(report.sent);
            total.conflicts.extend(report.conflicts);
            total.rejections.extend(report.rejections);
            if !total.rejections.is_empty() {
                warn!(
                    collection = %self.collection,
                    rejected = total.rejections.len(),
                    "Push aborted after rejections"
                );
                break;
            }
        }
        Ok(total)
    }

    /// One full cycle: pull, then push, then hand conflicts to the
    /// conflict handler.
    ///
    /// # Errors
    ///
    /// - [`SyncError::PullFailure`] if the change feed could not be read;
    ///   nothing is pushed in that cycle.
    /// - [`SyncError::PushFailure`] if the remote refused documents for
    ///   reasons other than conflicts. Accepted documents are still marked
    ///   synced.
    pub async fn sync_once(&self) -> Result<CycleReport> {
        let _cycle = self.cycle.lock().await;
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        self.set_phase(Phase::Pulling);
        let pull = match self.pull().await {
            Ok(report) => report,
            Err(e) => {
                self.set_phase(Phase::Idle);
                return Err(e);
            }
        };

        self.set_phase(Phase::Pushing);
        let push = self.push_pending().await;
        self.set_phase(Phase::Idle);
        let push = push?;

        if !push.conflicts.is_empty() {
            self.hand_off(push.conflicts.clone())?;
        }
        if !push.rejections.is_empty() {
            return Err(SyncError::PushFailure {
                collection: self.collection.clone(),
                rejections: push.rejections,
            });
        }

        Ok(CycleReport { pull, push })
    }

    /// Run cycles in the background until cancelled.
    pub fn start(self) -> ReplicationHandle {
        let engine = Arc::new(self);
        let task = tokio::spawn(engine.clone().run());
        ReplicationHandle { engine, task }
    }

    async fn run(self: Arc<Self>) {
        info!(collection = %self.collection, db = %self.remote.name(), "Replication started");
        let mut ticker = time::interval(self.options.pull_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let live = self.options.live;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.run_cycle() => {}
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.resync.notified() => {
                    debug!(collection = %self.collection, "Resync requested");
                }
                _ = ticker.tick(), if live => {}
            }
        }

        self.set_phase(Phase::Stopped);
        info!(collection = %self.collection, "Replication stopped");
    }

    async fn run_cycle(&self) {
        match self.sync_once().await {
            Ok(_) => {
                self.state.send_modify(|state| {
                    state.last_error = None;
                    state.cycles += 1;
                });
            }
            Err(SyncError::Cancelled) => {}
            Err(e) => {
                let retryable = e.is_retryable();
                if retryable {
                    warn!(collection = %self.collection, error = %e, "Replication cycle failed, retrying next tick");
                } else {
                    error!(collection = %self.collection, error = %e, "Replication cycle failed");
                }
                let message = e.to_string();
                self.state.send_modify(|state| {
                    state.last_error = Some(message.clone());
                    state.cycles += 1;
                });
                self.emit(ReplicationEvent::Error {
                    collection: self.collection.clone(),
                    message,
                    retryable,
                });
            }
        }
    }

    async fn fetch_conflicts(&self, ids: &[String]) -> Result<Vec<Document>> {
        let rows = self.remote.all_docs_with_docs(ids).await?;
        let mut found: HashMap<String, Document> = rows
            .into_iter()
            .filter_map(|row| row.into_document())
            .map(|doc| (doc.id.clone(), doc))
            .collect();

        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = found.remove(id) {
                documents.push(doc);
                continue;
            }
            match self.remote.get_latest(id).await? {
                Some(doc) => documents.push(doc),
                None => warn!(
                    collection = %self.collection,
                    %id,
                    "Conflicting document no longer exists remotely, it stays pending"
                ),
            }
        }
        Ok(documents)
    }

    fn hand_off(&self, conflicts: Vec<Document>) -> Result<()> {
        match &self.conflict_handler {
            Some(handler) => {
                handler.resolve(&self.store, &self.collection, conflicts)?;
            }
            None => {
                debug!(
                    collection = %self.collection,
                    count = conflicts.len(),
                    "No conflict handler, conflicts left pending"
                );
            }
        }
        Ok(())
    }

    fn pull_failure(&self, e: SyncError) -> SyncError {
        match e {
            SyncError::Store(_) | SyncError::Cancelled | SyncError::PullFailure { .. } => e,
            other => SyncError::PullFailure {
                collection: self.collection.clone(),
                reason: other.to_string(),
            },
        }
    }

    fn set_phase(&self, phase: Phase) {
        let changed = self.state.send_if_modified(|state| {
            if state.phase == phase || state.phase == Phase::Stopped {
                return false;
            }
            state.phase = phase;
            true
        });
        if changed {
            self.emit(ReplicationEvent::PhaseChanged {
                collection: self.collection.clone(),
                phase,
            });
        }
    }

    fn emit(&self, event: ReplicationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("collection", &self.collection)
            .field("remote", &self.remote.name())
            .field("options", &self.options)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

/// A running engine.
#[derive(Debug)]
pub struct ReplicationHandle {
    engine: Arc<ReplicationEngine>,
    task: JoinHandle<()>,
}

impl ReplicationHandle {
    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    pub fn state(&self) -> ReplicationState {
        self.engine.state()
    }

    pub fn resync(&self) {
        self.engine.resync();
    }

    pub fn cancel(&self) {
        self.engine.cancel();
    }

    /// Wait for the background task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(collection = %self.engine.collection, "Replication task panicked");
            }
        }
    }

    /// Cancel and wait.
    pub async fn stop(self) {
        self.cancel();
        self.join().await;
    }
}
