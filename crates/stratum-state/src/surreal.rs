//! SurrealDB-backed `DocumentStore` implementation
//!
//! Persists documents in a single `documents` table (see `migrations`),
//! converting to/from the `traits::Document` type at the boundary. Supports
//! an in-memory engine for tests and a surrealkv file engine for embedded
//! durability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::traits::{Collection, DocId, DocQuery, Document, DocumentStore, StorageResult};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Database row for a stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbDocument {
    doc_id: String,
    collection: String,
    owner: Option<String>,
    channel: Option<String>,
    stratum: Option<String>,
    tags: Vec<String>,
    importance: Option<u8>,
    #[serde(default, with = "surreal_datetime_opt")]
    last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(with = "surreal_datetime")]
    created_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl From<Document> for DbDocument {
    fn from(doc: Document) -> Self {
        Self {
            doc_id: doc.id.0,
            collection: doc.collection.as_str().to_string(),
            owner: doc.owner,
            channel: doc.channel,
            stratum: doc.stratum,
            tags: doc.tags,
            importance: doc.importance,
            last_accessed_at: doc.last_accessed_at,
            expires_at: doc.expires_at,
            created_at: doc.created_at,
            payload: doc.payload,
        }
    }
}

impl DbDocument {
    fn into_document(self, collection: Collection) -> Document {
        Document {
            id: DocId(self.doc_id),
            collection,
            owner: self.owner,
            channel: self.channel,
            stratum: self.stratum,
            tags: self.tags,
            importance: self.importance,
            last_accessed_at: self.last_accessed_at,
            expires_at: self.expires_at,
            created_at: self.created_at,
            payload: self.payload,
        }
    }
}

/// SurrealDB-backed implementation of [`DocumentStore`].
#[derive(Clone)]
pub struct SurrealDocStore {
    db: Surreal<Any>,
}

impl SurrealDocStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `stratum/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Create a file-backed instance using the surrealkv engine.
    pub async fn on_disk(path: &str) -> crate::Result<Self> {
        Self::connect(&format!("surrealkv://{path}")).await
    }

    async fn connect(endpoint: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(endpoint)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        db.use_ns("stratum")
            .use_db("main")
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!(endpoint, "SurrealDocStore connected");
        Ok(Self { db })
    }

    async fn fetch(&self, collection: Collection, id: &DocId) -> StorageResult<Option<DbDocument>> {
        let mut res = self
            .db
            .query("SELECT * FROM documents WHERE collection = $c AND doc_id = $d")
            .bind(("c", collection.as_str().to_string()))
            .bind(("d", id.0.clone()))
            .await?;
        let rows: Vec<DbDocument> = res.take(0)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl DocumentStore for SurrealDocStore {
    async fn put(&self, doc: Document) -> StorageResult<()> {
        let collection = doc.collection;
        let row = DbDocument::from(doc);

        if self.fetch(collection, &DocId(row.doc_id.clone())).await?.is_some() {
            let doc_id = row.doc_id.clone();
            self.db
                .query("UPDATE documents CONTENT $row WHERE collection = $c AND doc_id = $d")
                .bind(("row", row))
                .bind(("c", collection.as_str().to_string()))
                .bind(("d", doc_id))
                .await?;
        } else {
            debug!(doc_id = %row.doc_id, collection = %collection, "creating document");
            let _: Option<DbDocument> = self.db.create("documents").content(row).await?;
        }
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &DocId) -> StorageResult<Document> {
        match self.fetch(collection, id).await? {
            Some(row) => Ok(row.into_document(collection)),
            None => Err(StorageError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn delete(&self, collection: Collection, id: &DocId) -> StorageResult<()> {
        self.db
            .query("DELETE FROM documents WHERE collection = $c AND doc_id = $d")
            .bind(("c", collection.as_str().to_string()))
            .bind(("d", id.0.clone()))
            .await?;
        Ok(())
    }

    async fn query(&self, q: &DocQuery) -> StorageResult<Vec<Document>> {
        let mut sql = String::from("SELECT * FROM documents WHERE collection = $c");
        if q.stratum.is_some() {
            sql.push_str(" AND stratum = $stratum");
        }
        if q.owner.is_some() {
            sql.push_str(" AND owner = $owner");
        }
        if q.channel.is_some() {
            sql.push_str(" AND channel = $channel");
        }
        if !q.tags.is_empty() {
            sql.push_str(" AND tags CONTAINSALL $tags");
        }
        if q.min_importance.is_some() {
            sql.push_str(" AND importance >= $min_importance");
        }
        if q.accessed_after.is_some() {
            sql.push_str(" AND last_accessed_at >= $accessed_after");
        }
        sql.push_str(" ORDER BY created_at DESC");
        if q.limit.is_some() {
            sql.push_str(" LIMIT $limit");
        }

        let mut req = self
            .db
            .query(sql)
            .bind(("c", q.collection.as_str().to_string()));
        if let Some(ref stratum) = q.stratum {
            req = req.bind(("stratum", stratum.clone()));
        }
        if let Some(ref owner) = q.owner {
            req = req.bind(("owner", owner.clone()));
        }
        if let Some(ref channel) = q.channel {
            req = req.bind(("channel", channel.clone()));
        }
        if !q.tags.is_empty() {
            req = req.bind(("tags", q.tags.clone()));
        }
        if let Some(min) = q.min_importance {
            req = req.bind(("min_importance", min));
        }
        if let Some(after) = q.accessed_after {
            req = req.bind(("accessed_after", SurrealDatetime::from(after)));
        }
        if let Some(limit) = q.limit {
            req = req.bind(("limit", limit));
        }

        let mut res = req.await?;
        let rows: Vec<DbDocument> = res.take(0)?;
        Ok(rows
            .into_iter()
            .map(|r| r.into_document(q.collection))
            .collect())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> StorageResult<Vec<DocId>> {
        let mut res = self
            .db
            .query("SELECT * FROM documents WHERE expires_at != NONE AND expires_at <= $now")
            .bind(("now", SurrealDatetime::from(now)))
            .await?;
        let due: Vec<DbDocument> = res.take(0)?;

        if due.is_empty() {
            return Ok(Vec::new());
        }

        self.db
            .query("DELETE FROM documents WHERE expires_at != NONE AND expires_at <= $now")
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let mut removed: Vec<DocId> = due.into_iter().map(|d| DocId(d.doc_id)).collect();
        removed.sort();
        debug!(count = removed.len(), "expired documents removed");
        Ok(removed)
    }
}
