use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use store::live::Publisher;
use store::{
    merge_fields, BlobStore, ChangeStream, Document, DocumentStore, DocumentStream, Query,
};
use tokio::sync::Mutex;

/// In-memory realtime backend. Fully implements the store contract including
/// live subscriptions, which makes it the reference backend for engine tests
/// and for running without any external service.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    publisher: Publisher,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document_count(&self, collection: &str) -> usize {
        let collections = self.inner.collections.lock().await;
        collections.get(collection).map(BTreeMap::len).unwrap_or(0)
    }

    pub async fn active_subscriptions(&self) -> usize {
        self.inner.publisher.active_total().await
    }

    pub async fn subscriptions_on(&self, collection: &str) -> usize {
        self.inner.publisher.active(collection).await
    }

    async fn snapshot(&self, collection: &str) -> Vec<Document> {
        let collections = self.inner.collections.lock().await;
        snapshot_of(collections.get(collection))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let collections = self.inner.collections.lock().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|data| Document::new(id, data.clone())))
    }

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>> {
        Ok(query.apply(self.snapshot(collection).await))
    }

    async fn subscribe(&self, collection: &str, query: Query) -> Result<DocumentStream> {
        let snapshot = self.snapshot(collection).await;
        Ok(self
            .inner
            .publisher
            .subscribe(collection, query, snapshot)
            .await)
    }

    async fn subscribe_changes(&self, collection: &str, query: Query) -> Result<ChangeStream> {
        let snapshot = self.snapshot(collection).await;
        Ok(self
            .inner
            .publisher
            .subscribe_changes(collection, query, snapshot)
            .await)
    }

    async fn write(&self, collection: &str, id: &str, data: Value) -> Result<()> {
        let snapshot = {
            let mut collections = self.inner.collections.lock().await;
            let docs = collections.entry(collection.to_owned()).or_default();
            docs.insert(id.to_owned(), data);
            snapshot_of(Some(docs))
        };
        self.inner.publisher.publish(collection, &snapshot).await;
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: BTreeMap<String, Value>,
    ) -> Result<()> {
        let snapshot = {
            let mut collections = self.inner.collections.lock().await;
            let docs = collections.entry(collection.to_owned()).or_default();
            let body = docs
                .entry(id.to_owned())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            merge_fields(body, fields);
            snapshot_of(Some(docs))
        };
        self.inner.publisher.publish(collection, &snapshot).await;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let snapshot = {
            let mut collections = self.inner.collections.lock().await;
            match collections.get_mut(collection) {
                Some(docs) => {
                    docs.remove(id);
                    snapshot_of(Some(docs))
                }
                None => return Ok(()),
            }
        };
        self.inner.publisher.publish(collection, &snapshot).await;
        Ok(())
    }
}

/// Blob storage backed by a map, addressed by `mem://` URLs.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn blob_count(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn contains(&self, url: &str) -> bool {
        self.blobs.lock().await.contains_key(url)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(&self, bytes: Vec<u8>, path: &str, name: &str) -> Result<String> {
        if name.trim().is_empty() {
            return Err(anyhow!("blob name must not be empty"));
        }
        let url = format!("mem://{path}/{name}");
        self.blobs.lock().await.insert(url.clone(), bytes);
        Ok(url)
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        Ok(self.blobs.lock().await.remove(url).is_some())
    }
}

fn snapshot_of(docs: Option<&BTreeMap<String, Value>>) -> Vec<Document> {
    match docs {
        Some(docs) => docs
            .iter()
            .map(|(id, data)| Document::new(id.clone(), data.clone()))
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
