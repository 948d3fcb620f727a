use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use memstore::{MemoryBlobStore, MemoryStore};
use serde_json::Value;
use shared::domain::{SessionId, SessionKind, UserId};
use shared::model::{SessionRecord, UserProfile};
use store::{BlobStore, ChangeStream, Document, DocumentStore, DocumentStream, Query};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{sleep, timeout};

use crate::{EngineConfig, SyncEngine, SyncEvent};

/// Wrapper around [`MemoryStore`] that records mutations and can be told to
/// fail specific operations, for exercising partial-failure paths.
pub(crate) struct RecordingStore {
    inner: MemoryStore,
    writes: Mutex<Vec<String>>,
    fail_writes: Mutex<Option<String>>,
    fail_deletes: Mutex<Option<String>>,
    fail_next_writes: AtomicUsize,
}

impl RecordingStore {
    pub(crate) fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            writes: Mutex::new(Vec::new()),
            fail_writes: Mutex::new(None),
            fail_deletes: Mutex::new(None),
            fail_next_writes: AtomicUsize::new(0),
        }
    }

    /// Fail every write or update whose collection path contains the fragment.
    pub(crate) async fn fail_writes_to(&self, fragment: &str) {
        *self.fail_writes.lock().await = Some(fragment.to_owned());
    }

    pub(crate) async fn fail_deletes_to(&self, fragment: &str) {
        *self.fail_deletes.lock().await = Some(fragment.to_owned());
    }

    /// Fail the next `n` writes regardless of collection.
    pub(crate) fn fail_next_writes(&self, n: usize) {
        self.fail_next_writes.store(n, Ordering::SeqCst);
    }

    pub(crate) async fn clear_failures(&self) {
        *self.fail_writes.lock().await = None;
        *self.fail_deletes.lock().await = None;
        self.fail_next_writes.store(0, Ordering::SeqCst);
    }

    pub(crate) async fn recorded_writes(&self) -> Vec<String> {
        self.writes.lock().await.clone()
    }

    async fn check_write(&self, collection: &str) -> Result<()> {
        if self.fail_next_writes.load(Ordering::SeqCst) > 0 {
            self.fail_next_writes.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow!("injected write failure on '{collection}'"));
        }
        let fail = self.fail_writes.lock().await;
        if let Some(fragment) = fail.as_ref() {
            if collection.contains(fragment) {
                return Err(anyhow!("injected write failure on '{collection}'"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.inner.get(collection, id).await
    }

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>> {
        self.inner.query(collection, query).await
    }

    async fn subscribe(&self, collection: &str, query: Query) -> Result<DocumentStream> {
        self.inner.subscribe(collection, query).await
    }

    async fn subscribe_changes(&self, collection: &str, query: Query) -> Result<ChangeStream> {
        self.inner.subscribe_changes(collection, query).await
    }

    async fn write(&self, collection: &str, id: &str, data: Value) -> Result<()> {
        self.check_write(collection).await?;
        self.writes
            .lock()
            .await
            .push(format!("write {collection}/{id}"));
        self.inner.write(collection, id, data).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.check_write(collection).await?;
        self.writes
            .lock()
            .await
            .push(format!("update {collection}/{id}"));
        self.inner.update(collection, id, fields).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        {
            let fail = self.fail_deletes.lock().await;
            if let Some(fragment) = fail.as_ref() {
                if collection.contains(fragment) {
                    return Err(anyhow!("injected delete failure on '{collection}'"));
                }
            }
        }
        self.writes
            .lock()
            .await
            .push(format!("delete {collection}/{id}"));
        self.inner.delete(collection, id).await
    }
}

/// Blob store with switchable delete failures, for the blob-first delete
/// contract.
pub(crate) struct FailingBlobStore {
    inner: MemoryBlobStore,
    fail_deletes: AtomicBool,
}

impl FailingBlobStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryBlobStore::new(),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub(crate) async fn blob_count(&self) -> usize {
        self.inner.blob_count().await
    }

    pub(crate) async fn contains(&self, url: &str) -> bool {
        self.inner.contains(url).await
    }
}

#[async_trait]
impl BlobStore for FailingBlobStore {
    async fn upload(&self, bytes: Vec<u8>, path: &str, name: &str) -> Result<String> {
        self.inner.upload(bytes, path, name).await
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(anyhow!("injected blob delete failure for '{url}'"));
        }
        self.inner.delete(url).await
    }
}

pub(crate) struct Fixture {
    pub(crate) engine: Arc<SyncEngine>,
    pub(crate) store: MemoryStore,
    pub(crate) recording: Arc<RecordingStore>,
    pub(crate) blobs: Arc<FailingBlobStore>,
}

impl Fixture {
    pub(crate) fn new(user: &str) -> Self {
        Self::with_config(EngineConfig::new(user))
    }

    pub(crate) fn with_config(config: EngineConfig) -> Self {
        let store = MemoryStore::new();
        let recording = Arc::new(RecordingStore::new(store.clone()));
        let blobs = Arc::new(FailingBlobStore::new());
        let engine =
            SyncEngine::new(config, recording.clone(), blobs.clone()).expect("engine");
        Fixture {
            engine,
            store,
            recording,
            blobs,
        }
    }

    /// Second engine over the same backend, signed in as another user.
    pub(crate) fn sharing(&self, user: &str) -> Self {
        let recording = Arc::new(RecordingStore::new(self.store.clone()));
        let engine = SyncEngine::new(EngineConfig::new(user), recording.clone(), self.blobs.clone())
            .expect("engine");
        Fixture {
            engine,
            store: self.store.clone(),
            recording,
            blobs: self.blobs.clone(),
        }
    }
}

pub(crate) async fn seed_profile(store: &MemoryStore, user: &str, name: &str) {
    let profile = UserProfile {
        user_id: UserId::new(user),
        display_name: Some(name.to_owned()),
        photo_url: None,
    };
    store
        .write(
            "profiles",
            user,
            serde_json::to_value(&profile).expect("encode profile"),
        )
        .await
        .expect("seed profile");
}

pub(crate) async fn seed_group_session(
    store: &MemoryStore,
    session_id: &str,
    members: &[&str],
    name: &str,
) {
    let record = SessionRecord {
        session_id: SessionId::new(session_id),
        kind: SessionKind::Group,
        members: members.iter().map(|member| UserId::new(*member)).collect(),
        pair_key: None,
        name: Some(name.to_owned()),
        photo_url: None,
        created_by: UserId::new(members[0]),
        created_at: Utc::now(),
        last_message: None,
    };
    store
        .write(
            "sessions",
            session_id,
            serde_json::to_value(&record).expect("encode session"),
        )
        .await
        .expect("seed session");
}

/// Wait until the receiver yields an event matching the predicate.
pub(crate) async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<SyncEvent>,
    mut matching: F,
) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if matching(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event channel closed: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Let spawned pump tasks drain their pending emissions.
pub(crate) async fn settle() {
    sleep(Duration::from_millis(20)).await;
}

/// Collect whatever is currently queued on the receiver without waiting.
pub(crate) fn drain_events(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
