use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use store::live::Publisher;
use store::{
    merge_fields, ChangeStream, Document, DocumentStore, DocumentStream, Query,
};

/// SQLite-backed document store. Documents are rows in a single table keyed
/// by (collection, id) with the body stored as JSON text; live subscriptions
/// are served by re-reading the collection after each local mutation, so
/// subscription semantics match the in-memory backend exactly.
#[derive(Clone)]
pub struct SqlDocumentStore {
    pool: Pool<Sqlite>,
    publisher: Arc<Publisher>,
}

impl SqlDocumentStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let connect_options =
            SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let store = Self {
            pool,
            publisher: Arc::new(Publisher::new()),
        };
        store.ensure_documents_table().await?;
        Ok(store)
    }

    async fn ensure_documents_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                doc_id     TEXT NOT NULL,
                body       TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (collection, doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure documents table exists")?;
        Ok(())
    }

    async fn collection_snapshot(&self, collection: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT doc_id, body FROM documents WHERE collection = ? ORDER BY doc_id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get(0);
            let raw: String = row.get(1);
            let data: Value = serde_json::from_str(&raw)
                .with_context(|| format!("stored document '{collection}/{id}' is not valid JSON"))?;
            docs.push(Document::new(id, data));
        }
        Ok(docs)
    }

    async fn upsert(&self, collection: &str, id: &str, data: &Value) -> Result<()> {
        let body = serde_json::to_string(data)?;
        sqlx::query(
            r#"
            INSERT INTO documents (collection, doc_id, body, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (collection, doc_id)
            DO UPDATE SET body = excluded.body, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn publish(&self, collection: &str) -> Result<()> {
        let snapshot = self.collection_snapshot(collection).await?;
        self.publisher.publish(collection, &snapshot).await;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqlDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.get(0);
                let data: Value = serde_json::from_str(&raw).with_context(|| {
                    format!("stored document '{collection}/{id}' is not valid JSON")
                })?;
                Ok(Some(Document::new(id, data)))
            }
            None => Ok(None),
        }
    }

    async fn query(&self, collection: &str, query: Query) -> Result<Vec<Document>> {
        Ok(query.apply(self.collection_snapshot(collection).await?))
    }

    async fn subscribe(&self, collection: &str, query: Query) -> Result<DocumentStream> {
        let snapshot = self.collection_snapshot(collection).await?;
        Ok(self.publisher.subscribe(collection, query, snapshot).await)
    }

    async fn subscribe_changes(&self, collection: &str, query: Query) -> Result<ChangeStream> {
        let snapshot = self.collection_snapshot(collection).await?;
        Ok(self
            .publisher
            .subscribe_changes(collection, query, snapshot)
            .await)
    }

    async fn write(&self, collection: &str, id: &str, data: Value) -> Result<()> {
        self.upsert(collection, id, &data).await?;
        self.publish(collection).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: BTreeMap<String, Value>,
    ) -> Result<()> {
        let mut body = match self.get(collection, id).await? {
            Some(doc) => doc.data,
            None => Value::Object(serde_json::Map::new()),
        };
        merge_fields(&mut body, fields);
        self.upsert(collection, id, &body).await?;
        self.publish(collection).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.publish(collection).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
