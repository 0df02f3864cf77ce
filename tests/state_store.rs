//! State store TTL, versioning, and sweeper guarantees

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tenderflow::comms::{InMemoryStateStore, StateCategory, StateStore};

#[tokio::test]
async fn ttl_entries_vanish_from_every_read_api() {
    let store = InMemoryStateStore::new();
    store
        .set(
            "workflow:wf-1:checkpoint",
            json!({"stage": "pricing_calculation"}),
            StateCategory::Workflow,
            Some(Duration::from_millis(25)),
        )
        .await;

    assert!(store.exists("workflow:wf-1:checkpoint").await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(store.get("workflow:wf-1:checkpoint").await.is_none());
    assert!(!store.exists("workflow:wf-1:checkpoint").await);
    assert!(store.get_all("workflow:*").await.is_empty());
}

#[tokio::test]
async fn sweeper_reclaims_without_disturbing_live_entries() {
    let store = Arc::new(InMemoryStateStore::with_sweep_interval(
        Duration::from_millis(20),
    ));
    store.connect().await;

    store
        .set(
            "cache:stale",
            json!(1),
            StateCategory::Cache,
            Some(Duration::from_millis(5)),
        )
        .await;
    store.set("cache:live", json!(2), StateCategory::Cache, None).await;

    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(store.raw_len(), 1);
    assert_eq!(store.get("cache:live").await, Some(json!(2)));
    store.disconnect().await;
}

#[tokio::test]
async fn overwrites_bump_versions_and_reset_ttl() {
    let store = InMemoryStateStore::new();
    store
        .set(
            "session:s1",
            json!("a"),
            StateCategory::Session,
            Some(Duration::from_millis(30)),
        )
        .await;
    // Overwrite with no TTL: the entry must stop expiring.
    store.set("session:s1", json!("b"), StateCategory::Session, None).await;

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.get("session:s1").await, Some(json!("b")));
}

#[tokio::test]
async fn concurrent_increments_never_lose_updates() {
    let store = Arc::new(InMemoryStateStore::new());
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            for _ in 0..100 {
                store.increment("metrics:processed", 1).await;
            }
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }
    assert_eq!(store.get("metrics:processed").await, Some(json!(1000)));
}
