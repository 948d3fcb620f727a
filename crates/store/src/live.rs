use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::{ChangeKind, ChangeStream, Document, DocumentChange, DocumentStream, Query};

enum Sink {
    Snapshots(mpsc::UnboundedSender<Vec<Document>>),
    /// Carries the previously emitted view keyed by document id so each
    /// emission can be classified as added/modified/removed.
    Changes(
        mpsc::UnboundedSender<Vec<DocumentChange>>,
        HashMap<String, Value>,
    ),
}

impl Sink {
    fn is_closed(&self) -> bool {
        match self {
            Sink::Snapshots(tx) => tx.is_closed(),
            Sink::Changes(tx, _) => tx.is_closed(),
        }
    }
}

struct Registration {
    collection: String,
    query: Query,
    sink: Sink,
}

/// Subscription registry shared by the in-process backends. Each backend
/// publishes a full collection snapshot after every mutation; the publisher
/// fans it out to live subscribers, applying each subscriber's query and
/// pruning subscribers whose receiving side has been dropped.
#[derive(Default)]
pub struct Publisher {
    registrations: Mutex<Vec<Registration>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(
        &self,
        collection: &str,
        query: Query,
        snapshot: Vec<Document>,
    ) -> DocumentStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = query.apply(snapshot);
        let _ = tx.send(initial);
        self.registrations.lock().await.push(Registration {
            collection: collection.to_owned(),
            query,
            sink: Sink::Snapshots(tx),
        });
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    pub async fn subscribe_changes(
        &self,
        collection: &str,
        query: Query,
        snapshot: Vec<Document>,
    ) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = query.apply(snapshot);
        let mut last_seen = HashMap::with_capacity(initial.len());
        let changes: Vec<DocumentChange> = initial
            .into_iter()
            .map(|document| {
                last_seen.insert(document.id.clone(), document.data.clone());
                DocumentChange {
                    document,
                    kind: ChangeKind::Added,
                }
            })
            .collect();
        let _ = tx.send(changes);
        self.registrations.lock().await.push(Registration {
            collection: collection.to_owned(),
            query,
            sink: Sink::Changes(tx, last_seen),
        });
        Box::pin(UnboundedReceiverStream::new(rx))
    }

    /// Fan the collection's current state out to every live subscriber of
    /// that collection. Subscribers with a dropped receiver are removed.
    pub async fn publish(&self, collection: &str, snapshot: &[Document]) {
        let mut registrations = self.registrations.lock().await;
        registrations.retain_mut(|registration| {
            if registration.collection != collection {
                return !registration.sink.is_closed();
            }
            let current = registration.query.apply(snapshot.to_vec());
            match &mut registration.sink {
                Sink::Snapshots(tx) => tx.send(current).is_ok(),
                Sink::Changes(tx, last_seen) => {
                    let changes = diff(last_seen, &current);
                    *last_seen = current
                        .iter()
                        .map(|doc| (doc.id.clone(), doc.data.clone()))
                        .collect();
                    if changes.is_empty() {
                        !tx.is_closed()
                    } else {
                        tx.send(changes).is_ok()
                    }
                }
            }
        });
    }

    /// Count of live subscriptions on one collection.
    pub async fn active(&self, collection: &str) -> usize {
        let mut registrations = self.registrations.lock().await;
        registrations.retain(|registration| !registration.sink.is_closed());
        registrations
            .iter()
            .filter(|registration| registration.collection == collection)
            .count()
    }

    /// Count of live subscriptions across all collections.
    pub async fn active_total(&self) -> usize {
        let mut registrations = self.registrations.lock().await;
        let before = registrations.len();
        registrations.retain(|registration| !registration.sink.is_closed());
        if registrations.len() != before {
            debug!(
                pruned = before - registrations.len(),
                remaining = registrations.len(),
                "live: pruned closed subscriptions"
            );
        }
        registrations.len()
    }
}

fn diff(last_seen: &HashMap<String, Value>, current: &[Document]) -> Vec<DocumentChange> {
    let mut changes = Vec::new();
    for document in current {
        match last_seen.get(&document.id) {
            None => changes.push(DocumentChange {
                document: document.clone(),
                kind: ChangeKind::Added,
            }),
            Some(previous) if previous != &document.data => changes.push(DocumentChange {
                document: document.clone(),
                kind: ChangeKind::Modified,
            }),
            Some(_) => {}
        }
    }
    let current_ids: HashSet<&str> = current.iter().map(|doc| doc.id.as_str()).collect();
    for (id, data) in last_seen {
        if !current_ids.contains(id.as_str()) {
            changes.push(DocumentChange {
                document: Document::new(id.clone(), data.clone()),
                kind: ChangeKind::Removed,
            });
        }
    }
    changes
}
