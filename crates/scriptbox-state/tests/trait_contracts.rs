//! Trait contract tests for SessionStore and HistoryStore.
//!
//! Every backend runs the same contract checks: the in-memory fakes, the
//! filesystem session store and SurrealDB over `mem://`.

use std::sync::Arc;

use chrono::{Duration, Utc};
use scriptbox_state::storage_traits::*;
use scriptbox_state::{
    FsSessionStore, MemoryHistoryStore, MemorySessionStore, StorageError, SurrealHistoryStore,
    SurrealSessionStore,
};
use serde_json::json;

fn sid(raw: &str) -> SessionId {
    SessionId::parse(raw).unwrap()
}

fn entry(id: &str, session: Option<&str>, finished_offset_secs: i64) -> HistoryEntry {
    let finished_at = Utc::now() + Duration::seconds(finished_offset_secs);
    HistoryEntry {
        execution_id: id.into(),
        session_id: session.map(str::to_string),
        script: "set x 1".into(),
        script_truncated: false,
        script_digest: "d".into(),
        security_level: "Standard".into(),
        success: true,
        outcome: "Completed".into(),
        exit_code: 0,
        result_summary: Some("1".into()),
        error: None,
        started_at: finished_at - Duration::milliseconds(5),
        finished_at,
        duration_ms: 5,
        memory_bytes: 128,
    }
}

// ===========================================================================
// SessionStore contract
// ===========================================================================

async fn session_contract(store: Arc<dyn SessionStore>) {
    let a = sid("tenant-a");
    let b = sid("tenant-b");

    // Absent sessions read as empty.
    assert!(store.load(&a).await.unwrap().is_none());
    assert!(store.get(&a, "k").await.unwrap().is_none());
    assert!(store.list(&a).await.unwrap().is_empty());

    // First write creates the session.
    store.set(&a, "counter", json!(1)).await.unwrap();
    store.set(&a, "name", json!("alice")).await.unwrap();
    assert_eq!(store.get(&a, "counter").await.unwrap(), Some(json!(1)));
    assert_eq!(store.list(&a).await.unwrap(), vec!["counter", "name"]);

    // Sessions are isolated.
    store.set(&b, "counter", json!(99)).await.unwrap();
    assert_eq!(store.get(&a, "counter").await.unwrap(), Some(json!(1)));

    // Batches apply in order.
    store
        .apply(
            &a,
            &[
                SessionOp::Set {
                    key: "counter".into(),
                    value: json!(2),
                },
                SessionOp::Remove { key: "name".into() },
            ],
        )
        .await
        .unwrap();
    let record = store.load(&a).await.unwrap().unwrap();
    assert_eq!(record.values.len(), 1);
    assert_eq!(record.values["counter"], json!(2));

    // Structured values survive.
    let nested = json!({"list": [1, 2.5, "x"], "flag": true, "none": null});
    store.set(&a, "nested", nested.clone()).await.unwrap();
    assert_eq!(store.get(&a, "nested").await.unwrap(), Some(nested));

    // Clear keeps the session.
    store.clear(&a).await.unwrap();
    assert!(store.list(&a).await.unwrap().is_empty());
    assert!(store.peek(&a).await.unwrap().is_some());

    let summaries = store.sessions().await.unwrap();
    let ids: Vec<&str> = summaries.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["tenant-a", "tenant-b"]);

    // Delete removes only the target.
    assert!(store.delete(&a).await.unwrap());
    assert!(!store.delete(&a).await.unwrap());
    assert!(store.peek(&a).await.unwrap().is_none());
    assert_eq!(store.get(&b, "counter").await.unwrap(), Some(json!(99)));
}

async fn session_cleanup_contract(store: Arc<dyn SessionStore>) {
    store.set(&sid("old"), "k", json!(1)).await.unwrap();
    store.set(&sid("fresh"), "k", json!(1)).await.unwrap();

    // Nothing is idle for a day yet.
    assert!(store.cleanup(Duration::days(1)).await.unwrap().is_empty());

    // A negative window puts the cutoff in the future: everything is stale.
    let removed = store.cleanup(Duration::seconds(-60)).await.unwrap();
    assert_eq!(removed, vec![sid("fresh"), sid("old")]);
    assert!(store.sessions().await.unwrap().is_empty());
}

async fn session_concurrent_writers(store: Arc<dyn SessionStore>) {
    let session = sid("shared");
    let mut handles = Vec::new();
    for i in 0..20 {
        let store = Arc::clone(&store);
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            store
                .set(&session, &format!("k{i}"), json!(i))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    // Serialized read-modify-write: no lost updates.
    assert_eq!(store.list(&session).await.unwrap().len(), 20);
}

#[tokio::test]
async fn memory_session_store_contract() {
    session_contract(Arc::new(MemorySessionStore::new())).await;
    session_cleanup_contract(Arc::new(MemorySessionStore::new())).await;
    session_concurrent_writers(Arc::new(MemorySessionStore::new())).await;
}

#[tokio::test]
async fn fs_session_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    session_contract(Arc::new(FsSessionStore::new(dir.path().join("a")).unwrap())).await;
    session_cleanup_contract(Arc::new(FsSessionStore::new(dir.path().join("b")).unwrap())).await;
    session_concurrent_writers(Arc::new(FsSessionStore::new(dir.path().join("c")).unwrap()))
        .await;
}

#[tokio::test]
async fn surreal_session_store_contract() {
    session_contract(Arc::new(SurrealSessionStore::in_memory().await.unwrap())).await;
    session_cleanup_contract(Arc::new(SurrealSessionStore::in_memory().await.unwrap())).await;
    session_concurrent_writers(Arc::new(SurrealSessionStore::in_memory().await.unwrap())).await;
}

// ===========================================================================
// HistoryStore contract
// ===========================================================================

async fn history_contract(store: Arc<dyn HistoryStore>) {
    store.append(entry("e1", Some("s1"), -30)).await.unwrap();
    store.append(entry("e2", None, -20)).await.unwrap();
    store.append(entry("e3", Some("s1"), -10)).await.unwrap();

    assert_eq!(store.count().await.unwrap(), 3);

    // Newest first.
    let recent = store.query(&HistoryQuery::recent(10)).await.unwrap();
    let ids: Vec<&str> = recent.iter().map(|e| e.execution_id.as_str()).collect();
    assert_eq!(ids, vec!["e3", "e2", "e1"]);

    // Limit applies after ordering.
    let top = store.query(&HistoryQuery::recent(1)).await.unwrap();
    assert_eq!(top[0].execution_id, "e3");

    // Session filter.
    let scoped = store
        .query(&HistoryQuery::for_session("s1", 10))
        .await
        .unwrap();
    assert_eq!(scoped.len(), 2);
    assert!(scoped.iter().all(|e| e.session_id.as_deref() == Some("s1")));

    // Each id is written once.
    let err = store.append(entry("e1", None, 0)).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateEntry { .. }));

    let got = store.get("e2").await.unwrap().unwrap();
    assert_eq!(got.memory_bytes, 128);
}

async fn history_retention_contract(store: Arc<dyn HistoryStore>) {
    for i in 0..6 {
        store
            .append(entry(&format!("e{i}"), None, i - 100))
            .await
            .unwrap();
    }

    // Prune never happens implicitly.
    assert_eq!(store.count().await.unwrap(), 6);

    // Count cap evicts oldest first.
    let evicted = store
        .prune(&HistoryRetention {
            max_entries: Some(4),
            max_age_secs: None,
        })
        .await
        .unwrap();
    assert_eq!(evicted, 2);
    assert!(store.get("e0").await.unwrap().is_none());
    assert!(store.get("e1").await.unwrap().is_none());
    assert!(store.get("e5").await.unwrap().is_some());

    // Age cap: everything finished ~95s ago or earlier.
    let evicted = store
        .prune(&HistoryRetention {
            max_entries: None,
            max_age_secs: Some(10),
        })
        .await
        .unwrap();
    assert_eq!(evicted, 4);
    assert_eq!(store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn memory_history_store_contract() {
    history_contract(Arc::new(MemoryHistoryStore::new())).await;
    history_retention_contract(Arc::new(MemoryHistoryStore::new())).await;
}

#[tokio::test]
async fn surreal_history_store_contract() {
    history_contract(Arc::new(SurrealHistoryStore::in_memory().await.unwrap())).await;
    history_retention_contract(Arc::new(SurrealHistoryStore::in_memory().await.unwrap())).await;
}
