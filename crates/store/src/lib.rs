use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::pin::Pin;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod config;
pub mod live;

/// A raw document as held by the remote store: an id plus an untyped JSON
/// body. Typed access goes through [`Document::decode`], which reports
/// malformed bodies instead of silently dropping them.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        serde_json::from_value(self.data.clone()).map_err(|source| DecodeError {
            id: self.id.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
#[error("malformed document '{id}': {source}")]
pub struct DecodeError {
    pub id: String,
    #[source]
    pub source: serde_json::Error,
}

/// Field predicates evaluated against a document body. Field names may be
/// dotted paths into nested objects.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { field: String, value: Value },
    Ge { field: String, value: Value },
    In { field: String, values: Vec<Value> },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ge {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In {
            field: field.into(),
            values,
        }
    }

    pub fn matches(&self, data: &Value) -> bool {
        match self {
            Filter::Eq { field, value } => field_at(data, field) == Some(value),
            Filter::Ge { field, value } => match field_at(data, field) {
                Some(actual) => compare_json(actual, value) != Ordering::Less,
                None => false,
            },
            Filter::In { field, values } => match field_at(data, field) {
                Some(actual) => values.contains(actual),
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// Filter + ordering + limit, evaluated identically by every backend so that
/// subscription semantics do not drift between them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.filters.iter().all(|filter| filter.matches(data))
    }

    pub fn apply(&self, mut docs: Vec<Document>) -> Vec<Document> {
        docs.retain(|doc| self.matches(&doc.data));
        if let Some(order) = &self.order {
            docs.sort_by(|a, b| {
                let ord = match (field_at(&a.data, &order.field), field_at(&b.data, &order.field)) {
                    (Some(left), Some(right)) => compare_json(left, right),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
        docs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub document: Document,
    pub kind: ChangeKind,
}

pub type DocumentStream = Pin<Box<dyn Stream<Item = Vec<Document>> + Send>>;
pub type ChangeStream = Pin<Box<dyn Stream<Item = Vec<DocumentChange>> + Send>>;

/// Remote real-time document store. Collections are slash-joined path
/// strings; document ids are addressed separately.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>>;

    /// Live view of a collection. The stream emits the full matching set
    /// immediately and again after every change to the collection.
    async fn subscribe(&self, collection: &str, query: Query) -> Result<DocumentStream>;

    /// Operation-tagged variant of [`DocumentStore::subscribe`]: each emission
    /// classifies documents as added, modified or removed relative to the
    /// previous emission.
    async fn subscribe_changes(&self, collection: &str, query: Query) -> Result<ChangeStream>;

    /// Create or fully replace a document.
    async fn write(&self, collection: &str, id: &str, data: Value) -> Result<()>;

    /// Merge the given fields into a document, creating it when absent. Keys
    /// may be dotted paths into nested objects; a `Value::Null` entry removes
    /// the named field.
    async fn update(&self, collection: &str, id: &str, fields: BTreeMap<String, Value>)
        -> Result<()>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload the bytes and return a stable reference URL.
    async fn upload(&self, bytes: Vec<u8>, path: &str, name: &str) -> Result<String>;

    /// Returns true when a blob was actually removed, false when nothing
    /// existed at the URL.
    async fn delete(&self, url: &str) -> Result<bool>;
}

/// Stand-in for configurations without media support. Uploads fail loudly;
/// deletes report that nothing was removed.
pub struct MissingBlobStore;

#[async_trait]
impl BlobStore for MissingBlobStore {
    async fn upload(&self, _bytes: Vec<u8>, path: &str, name: &str) -> Result<String> {
        Err(anyhow!(
            "no blob store configured; cannot upload '{path}/{name}'"
        ))
    }

    async fn delete(&self, _url: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Resolve a dotted field path inside a document body.
pub fn field_at<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Apply a partial update to a document body. See
/// [`DocumentStore::update`] for the path and null semantics.
pub fn merge_fields(target: &mut Value, fields: BTreeMap<String, Value>) {
    for (path, value) in fields {
        set_field(target, &path, value);
    }
}

fn set_field(target: &mut Value, path: &str, value: Value) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let map = match target.as_object_mut() {
        Some(map) => map,
        None => return,
    };
    match path.split_once('.') {
        None => {
            if value.is_null() {
                map.remove(path);
            } else {
                map.insert(path.to_owned(), value);
            }
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            set_field(child, rest, value);
        }
    }
}

fn compare_json(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(left), Value::Number(right)) => left
            .as_f64()
            .partial_cmp(&right.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(left), Value::String(right)) => left.cmp(right),
        (Value::Bool(left), Value::Bool(right)) => left.cmp(right),
        _ => Ordering::Equal,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
