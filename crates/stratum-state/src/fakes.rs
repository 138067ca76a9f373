//! In-memory fakes for storage traits (testing and embedded use)
//!
//! Provides `MemoryDocStore` and `ManualClock` that satisfy the trait
//! contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StorageError;
use crate::traits::*;

// ---------------------------------------------------------------------------
// MemoryDocStore
// ---------------------------------------------------------------------------

/// In-memory document store backed by a `HashMap<(collection, id), Document>`.
#[derive(Debug, Default)]
pub struct MemoryDocStore {
    docs: Mutex<HashMap<(Collection, DocId), Document>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents across all collections.
    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocStore {
    async fn put(&self, doc: Document) -> StorageResult<()> {
        let mut docs = self.docs.lock().unwrap();
        docs.insert((doc.collection, doc.id.clone()), doc);
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &DocId) -> StorageResult<Document> {
        let docs = self.docs.lock().unwrap();
        docs.get(&(collection, id.clone()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    async fn delete(&self, collection: Collection, id: &DocId) -> StorageResult<()> {
        let mut docs = self.docs.lock().unwrap();
        docs.remove(&(collection, id.clone()));
        Ok(())
    }

    async fn query(&self, q: &DocQuery) -> StorageResult<Vec<Document>> {
        let docs = self.docs.lock().unwrap();
        let mut matches: Vec<Document> = docs.values().filter(|d| q.matches(d)).cloned().collect();

        // Newest-created first; id tiebreak for determinism.
        matches.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        if let Some(limit) = q.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> StorageResult<Vec<DocId>> {
        let mut docs = self.docs.lock().unwrap();
        let due: Vec<(Collection, DocId)> = docs
            .iter()
            .filter(|(_, d)| matches!(d.expires_at, Some(at) if at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = Vec::with_capacity(due.len());
        for key in due {
            docs.remove(&key);
            removed.push(key.1);
        }
        removed.sort();
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Test clock that only moves when told to.
///
/// Lets retention tests travel through decay horizons without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start at the given instant.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current wall-clock time.
    pub fn from_wall_clock() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Advance the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
