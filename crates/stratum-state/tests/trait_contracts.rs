//! Trait contract tests for DocumentStore.
//!
//! These tests verify the behavioral contracts of the storage boundary
//! against both backends. Any conforming implementation must pass these.

use chrono::{Duration, Utc};
use stratum_state::fakes::MemoryDocStore;
use stratum_state::traits::*;
use stratum_state::{StorageError, SurrealDocStore};

fn entry_doc(id: &str, stratum: &str, tags: &[&str], importance: u8) -> Document {
    Document {
        id: DocId(id.into()),
        collection: Collection::Entries,
        owner: Some("agent-1".into()),
        channel: Some("chan-1".into()),
        stratum: Some(stratum.into()),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        importance: Some(importance),
        last_accessed_at: None,
        expires_at: None,
        created_at: Utc::now(),
        payload: serde_json::json!({"body": id}),
    }
}

// ===========================================================================
// Contract: CRUD
// ===========================================================================

async fn crud_contract(store: &dyn DocumentStore) {
    store
        .put(entry_doc("a", "working", &["t1"], 3))
        .await
        .unwrap();

    let got = store
        .get(Collection::Entries, &DocId("a".into()))
        .await
        .unwrap();
    assert_eq!(got.payload["body"], "a");

    // Replace under the same id
    store
        .put(entry_doc("a", "short_term", &["t1"], 4))
        .await
        .unwrap();
    let got = store
        .get(Collection::Entries, &DocId("a".into()))
        .await
        .unwrap();
    assert_eq!(got.stratum.as_deref(), Some("short_term"));

    store
        .delete(Collection::Entries, &DocId("a".into()))
        .await
        .unwrap();
    let err = store
        .get(Collection::Entries, &DocId("a".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));

    // Deleting again is a no-op
    store
        .delete(Collection::Entries, &DocId("a".into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn crud_contract_memory() {
    crud_contract(&MemoryDocStore::new()).await;
}

#[tokio::test]
async fn crud_contract_surreal() {
    let store = SurrealDocStore::in_memory().await.unwrap();
    crud_contract(&store).await;
}

// ===========================================================================
// Contract: conjunctive query
// ===========================================================================

async fn query_contract(store: &dyn DocumentStore) {
    store
        .put(entry_doc("low", "working", &["alpha"], 2))
        .await
        .unwrap();
    store
        .put(entry_doc("high", "working", &["alpha", "beta"], 4))
        .await
        .unwrap();
    store
        .put(entry_doc("other", "episodic", &["alpha", "beta"], 5))
        .await
        .unwrap();

    let q = DocQuery::all(Collection::Entries)
        .in_stratum("working")
        .with_tag("alpha")
        .with_tag("beta")
        .min_importance(3);
    let rows = store.query(&q).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, DocId("high".into()));

    // Collection scoping: no entry leaks into other collections
    let none = store
        .query(&DocQuery::all(Collection::Patterns))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn query_contract_memory() {
    query_contract(&MemoryDocStore::new()).await;
}

#[tokio::test]
async fn query_contract_surreal() {
    let store = SurrealDocStore::in_memory().await.unwrap();
    query_contract(&store).await;
}

// ===========================================================================
// Contract: owner scoping
// ===========================================================================

#[tokio::test]
async fn query_scopes_by_owner() {
    let store = MemoryDocStore::new();
    let mut mine = entry_doc("mine", "working", &[], 1);
    mine.owner = Some("agent-a".into());
    let mut theirs = entry_doc("theirs", "working", &[], 1);
    theirs.owner = Some("agent-b".into());
    store.put(mine).await.unwrap();
    store.put(theirs).await.unwrap();

    let rows = store
        .query(&DocQuery::all(Collection::Entries).owned_by("agent-a"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, DocId("mine".into()));
}

// ===========================================================================
// Contract: TTL expiry
// ===========================================================================

async fn ttl_contract(store: &dyn DocumentStore) {
    let now = Utc::now();

    let mut surprise = Document {
        id: DocId("s1".into()),
        collection: Collection::Surprises,
        owner: Some("agent-1".into()),
        channel: None,
        stratum: None,
        tags: Vec::new(),
        importance: None,
        last_accessed_at: None,
        expires_at: Some(now + Duration::hours(1)),
        created_at: now,
        payload: serde_json::json!({"score": 0.9}),
    };
    store.put(surprise.clone()).await.unwrap();
    surprise.id = DocId("s2".into());
    surprise.expires_at = Some(now + Duration::hours(48));
    store.put(surprise).await.unwrap();

    // Nothing due yet
    let removed = store.expire_due(now).await.unwrap();
    assert!(removed.is_empty());

    // One row crosses its TTL
    let removed = store.expire_due(now + Duration::hours(2)).await.unwrap();
    assert_eq!(removed, vec![DocId("s1".into())]);
    assert!(store
        .get(Collection::Surprises, &DocId("s2".into()))
        .await
        .is_ok());

    // Re-running with the same clock is a no-op
    let removed = store.expire_due(now + Duration::hours(2)).await.unwrap();
    assert!(removed.is_empty());
}

#[tokio::test]
async fn ttl_contract_memory() {
    ttl_contract(&MemoryDocStore::new()).await;
}

#[tokio::test]
async fn ttl_contract_surreal() {
    let store = SurrealDocStore::in_memory().await.unwrap();
    ttl_contract(&store).await;
}
