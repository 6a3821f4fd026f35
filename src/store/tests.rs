use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, PodStatus};
use kube::api::ObjectMeta;

use super::*;

fn config_map(name: &str, ddl: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        data: Some([("ddl.sql".to_string(), ddl.to_string())].into()),
        ..Default::default()
    }
}

fn pod(name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_memory_store_create_assigns_identity() {
    let store = MemoryStore::<ConfigMap>::new();
    let created = store.create(&config_map("a", "select 1")).await.unwrap();

    assert!(created.metadata.uid.is_some());
    assert!(created.metadata.creation_timestamp.is_some());
    assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

    let fetched = store.get("default", "a").await.unwrap().unwrap();
    assert_eq!(fetched.metadata.uid, created.metadata.uid);
}

#[tokio::test]
async fn test_memory_store_duplicate_create() {
    let store = MemoryStore::<ConfigMap>::new();
    store.create(&config_map("a", "x")).await.unwrap();
    let err = store.create(&config_map("a", "y")).await.unwrap_err();
    assert!(err.is_already_exists());
}

#[tokio::test]
async fn test_memory_store_stale_write_conflicts() {
    let store = MemoryStore::<ConfigMap>::new();
    let first = store.create(&config_map("a", "x")).await.unwrap();

    let mut second = first.clone();
    second.data = Some([("ddl.sql".to_string(), "y".to_string())].into());
    store.replace(&second).await.unwrap();

    let err = store.replace(&first).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
}

#[tokio::test]
async fn test_memory_store_replace_missing() {
    let store = MemoryStore::<ConfigMap>::new();
    let err = store.replace(&config_map("a", "x")).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_memory_store_status_write_paths_are_separate() {
    let store = MemoryStore::<Pod>::new();
    let created = store.create(&pod("apply")).await.unwrap();

    let mut with_status = created.clone();
    with_status.status = Some(PodStatus {
        phase: Some("Succeeded".to_string()),
        ..Default::default()
    });
    // A spec write does not touch status.
    let replaced = store.replace(&with_status).await.unwrap();
    assert!(replaced.status.is_none());

    let mut with_status = replaced.clone();
    with_status.status = Some(PodStatus {
        phase: Some("Succeeded".to_string()),
        ..Default::default()
    });
    let updated = store.replace_status(&with_status).await.unwrap();
    assert_eq!(
        updated.status.and_then(|s| s.phase).as_deref(),
        Some("Succeeded")
    );
}

#[tokio::test]
async fn test_memory_store_delete_without_finalizers() {
    let store = MemoryStore::<ConfigMap>::new();
    store.create(&config_map("a", "x")).await.unwrap();
    store.delete("default", "a").await.unwrap();
    assert!(store.get("default", "a").await.unwrap().is_none());
    // Absent objects delete cleanly.
    store.delete("default", "a").await.unwrap();
}

#[tokio::test]
async fn test_memory_store_finalizer_blocks_delete() {
    let store = MemoryStore::<ConfigMap>::new();
    let created = store.create(&config_map("a", "x")).await.unwrap();
    assert!(ensure_finalizer(&store, &created, "test/finalizer").await.unwrap());

    store.delete("default", "a").await.unwrap();
    let pending = store.get("default", "a").await.unwrap().unwrap();
    assert!(is_deleting(&pending));
    assert!(has_finalizer(&pending, "test/finalizer"));

    assert!(remove_finalizer(&store, &pending, "test/finalizer").await.unwrap());
    assert!(store.get("default", "a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ensure_finalizer_is_idempotent() {
    let store = MemoryStore::<ConfigMap>::new();
    let created = store.create(&config_map("a", "x")).await.unwrap();
    ensure_finalizer(&store, &created, "f").await.unwrap();
    let current = store.get("default", "a").await.unwrap().unwrap();
    assert!(!ensure_finalizer(&store, &current, "f").await.unwrap());
    assert_eq!(current.metadata.finalizers.unwrap().len(), 1);
}

#[tokio::test]
async fn test_memory_store_list_by_namespace() {
    let store = MemoryStore::<ConfigMap>::new();
    store.create(&config_map("a", "x")).await.unwrap();
    let mut other = config_map("b", "y");
    other.metadata.namespace = Some("other".to_string());
    store.create(&other).await.unwrap();

    assert_eq!(store.list(None).await.unwrap().len(), 2);
    let scoped = store.list(Some("other")).await.unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].metadata.name.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_memory_store_watch_sees_writes() {
    let store = MemoryStore::<ConfigMap>::new();
    let mut events = store.watch();

    store.create(&config_map("a", "x")).await.unwrap();
    store.delete("default", "a").await.unwrap();

    let created = events.next().await.unwrap();
    assert!(created.metadata.deletion_timestamp.is_none());
    let deleted = events.next().await.unwrap();
    assert!(deleted.metadata.deletion_timestamp.is_some());
}

#[tokio::test]
async fn test_memory_store_fail_on_write() {
    let store = MemoryStore::<ConfigMap>::new();
    store.set_fail_on_write(true).await;
    assert!(store.create(&config_map("a", "x")).await.is_err());
    store.set_fail_on_write(false).await;
    assert!(store.create(&config_map("a", "x")).await.is_ok());
}

#[test]
fn test_object_key_display() {
    assert_eq!(ObjectKey::new("ns", "users").to_string(), "ns/users");
}
