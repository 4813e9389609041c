//! Change notifications and live query streams.
//!
//! Every committed write publishes a [`ChangeEvent`] on the store's
//! broadcast channel. The streams below subscribe first, yield the current
//! value, then re-read the store whenever a relevant event arrives. A lagging
//! receiver re-reads instead of failing, so consumers always converge on the
//! latest state even if they miss intermediate events.

use crate::{document::Origin, CollectionName, Document, DocumentId, Store};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub collection: CollectionName,
    pub id: DocumentId,
    pub kind: ChangeKind,
    pub origin: Origin,
}

struct Watch {
    store: Store,
    rx: broadcast::Receiver<ChangeEvent>,
    collection: CollectionName,
    id: Option<DocumentId>,
    primed: bool,
}

impl Watch {
    /// Wait for the next event that concerns this watch. `false` once the
    /// channel is closed.
    async fn next_relevant(&mut self) -> bool {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    let same_collection = event.collection == self.collection;
                    let same_doc = self.id.as_ref().map_or(true, |id| *id == event.id);
                    if same_collection && same_doc {
                        return true;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, collection = %self.collection, "Observer lagged");
                    return true;
                }
                Err(RecvError::Closed) => return false,
            }
        }
    }
}

pub(crate) fn document_stream(
    store: Store,
    collection: CollectionName,
    id: DocumentId,
) -> BoxStream<'static, Option<Document>> {
    let watch = Watch {
        rx: store.subscribe(),
        store,
        collection,
        id: Some(id),
        primed: false,
    };

    stream::unfold(watch, |mut watch| async move {
        if watch.primed && !watch.next_relevant().await {
            return None;
        }
        watch.primed = true;
        let id = watch.id.clone().unwrap_or_default();
        let current = watch.store.get(&watch.collection, &id).ok().flatten();
        Some((current, watch))
    })
    .boxed()
}

pub(crate) fn collection_stream(
    store: Store,
    collection: CollectionName,
) -> BoxStream<'static, Vec<Document>> {
    let watch = Watch {
        rx: store.subscribe(),
        store,
        collection,
        id: None,
        primed: false,
    };

    stream::unfold(watch, |mut watch| async move {
        if watch.primed && !watch.next_relevant().await {
            return None;
        }
        watch.primed = true;
        let current = watch.store.all(&watch.collection).unwrap_or_default();
        Some((current, watch))
    })
    .boxed()
}
