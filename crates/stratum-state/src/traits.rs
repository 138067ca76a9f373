//! Storage trait definitions for the Stratum engine
//!
//! These traits define the persistence boundary the engine consumes:
//! - `DocumentStore`: typed-document CRUD with indexed query and TTL expiry
//! - `Clock`: monotonic time source
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module; a SurrealDB backend lives in
//! `surreal`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string) used for entry content lineage.
///
/// The inner field is private so the string is always valid lowercase hex
/// produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars), for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Monotonic time source consumed by the engine.
///
/// Production code uses [`SystemClock`]; tests use
/// [`crate::fakes::ManualClock`] to travel through decay horizons without
/// sleeping.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Unique identifier for a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(pub String);

impl DocId {
    /// Generate a new random DocId.
    pub fn new() -> Self {
        DocId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for DocId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical collection a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Memory entries across all strata.
    Entries,
    /// Write-once surprise audit records.
    Surprises,
    /// Consolidation-derived pattern records.
    Patterns,
}

impl Collection {
    /// Stable string form used as an indexed column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entries => "entries",
            Self::Surprises => "surprises",
            Self::Patterns => "patterns",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored document: indexed columns plus an opaque payload.
///
/// The engine serializes its domain types (memory entries, surprise records,
/// patterns) into `payload`; the surrounding columns exist so backends can
/// index and filter without understanding the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    pub collection: Collection,
    /// Owning agent, if scoped.
    pub owner: Option<String>,
    /// Owning channel, if scoped.
    pub channel: Option<String>,
    /// Stratum name for entry documents.
    pub stratum: Option<String>,
    pub tags: Vec<String>,
    /// Importance 1-5 for entry documents.
    pub importance: Option<u8>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// TTL bound; rows past this instant are removed by `expire_due`.
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Conjunctive filter for indexed document queries.
#[derive(Debug, Clone)]
pub struct DocQuery {
    pub collection: Collection,
    pub stratum: Option<String>,
    pub owner: Option<String>,
    pub channel: Option<String>,
    /// Every listed tag must be present on the document.
    pub tags: Vec<String>,
    pub min_importance: Option<u8>,
    pub accessed_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl DocQuery {
    /// Query matching every document in a collection.
    pub fn all(collection: Collection) -> Self {
        Self {
            collection,
            stratum: None,
            owner: None,
            channel: None,
            tags: Vec::new(),
            min_importance: None,
            accessed_after: None,
            limit: None,
        }
    }

    pub fn in_stratum(mut self, stratum: &str) -> Self {
        self.stratum = Some(stratum.to_string());
        self
    }

    pub fn owned_by(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn in_channel(mut self, channel: &str) -> Self {
        self.channel = Some(channel.to_string());
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn min_importance(mut self, importance: u8) -> Self {
        self.min_importance = Some(importance);
        self
    }

    pub fn accessed_after(mut self, after: DateTime<Utc>) -> Self {
        self.accessed_after = Some(after);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether the given document matches every filter clause.
    pub fn matches(&self, doc: &Document) -> bool {
        if doc.collection != self.collection {
            return false;
        }
        if let Some(ref stratum) = self.stratum {
            if doc.stratum.as_deref() != Some(stratum.as_str()) {
                return false;
            }
        }
        if let Some(ref owner) = self.owner {
            if doc.owner.as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        if let Some(ref channel) = self.channel {
            if doc.channel.as_deref() != Some(channel.as_str()) {
                return false;
            }
        }
        for tag in &self.tags {
            if !doc.tags.contains(tag) {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if doc.importance.unwrap_or(0) < min {
                return false;
            }
        }
        if let Some(after) = self.accessed_after {
            match doc.last_accessed_at {
                Some(at) if at >= after => {}
                _ => return false,
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

/// Document persistence consumed by the engine.
///
/// Guarantees:
/// - `put` is create-or-replace keyed by `(collection, id)`.
/// - `get` returns `StorageError::NotFound` for unknown ids.
/// - `query` applies every clause conjunctively; result order is
///   newest-created first (callers re-rank as needed).
/// - `expire_due(now)` removes every document whose `expires_at` is at or
///   before `now` and returns the removed ids.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create or replace a document.
    async fn put(&self, doc: Document) -> StorageResult<()>;

    /// Fetch a document by id.
    async fn get(&self, collection: Collection, id: &DocId) -> StorageResult<Document>;

    /// Delete a document by id. No-op if absent.
    async fn delete(&self, collection: Collection, id: &DocId) -> StorageResult<()>;

    /// Indexed conjunctive query, newest-created first.
    async fn query(&self, q: &DocQuery) -> StorageResult<Vec<Document>>;

    /// Remove every document whose TTL has elapsed; returns removed ids.
    async fn expire_due(&self, now: DateTime<Utc>) -> StorageResult<Vec<DocId>>;
}
