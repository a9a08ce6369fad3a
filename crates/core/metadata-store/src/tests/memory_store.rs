use crate::{InMemoryResourceStore, NEW_RESOURCE_MVCC, ResourcePath, ResourceStore};

#[tokio::test]
async fn put_creates_then_updates_with_increasing_versions() {
    //* Given
    let store = InMemoryResourceStore::new();
    let path = ResourcePath::new("p", "widget", "a");

    //* When
    let first = store
        .put(&path, b"one".to_vec(), NEW_RESOURCE_MVCC)
        .await
        .expect("create should succeed");
    let second = store
        .put(&path, b"two".to_vec(), first)
        .await
        .expect("update at current version should succeed");

    //* Then
    assert_eq!(first, 0, "first committed version should be 0");
    assert_eq!(second, 1, "each write should bump the version by one");
    let raw = store
        .get(&path)
        .await
        .expect("get should succeed")
        .expect("resource should exist");
    assert_eq!(raw.content, b"two");
    assert_eq!(raw.mvcc, 1);
}

#[tokio::test]
async fn put_with_stale_version_is_rejected() {
    //* Given
    let store = InMemoryResourceStore::new();
    let path = ResourcePath::new("p", "widget", "a");
    let v0 = store
        .put(&path, b"one".to_vec(), NEW_RESOURCE_MVCC)
        .await
        .expect("create should succeed");
    store
        .put(&path, b"two".to_vec(), v0)
        .await
        .expect("update should succeed");

    //* When
    let result = store.put(&path, b"stale".to_vec(), v0).await;

    //* Then
    let err = result.expect_err("stale write should be rejected");
    assert!(err.is_version_conflict(), "expected version conflict, got {err:?}");
    let raw = store.get(&path).await.expect("get should succeed");
    assert_eq!(
        raw.map(|r| r.content),
        Some(b"two".to_vec()),
        "stale write must not overwrite"
    );
}

#[tokio::test]
async fn create_of_existing_resource_is_rejected() {
    //* Given
    let store = InMemoryResourceStore::new();
    let path = ResourcePath::new("p", "widget", "a");
    store
        .put(&path, b"one".to_vec(), NEW_RESOURCE_MVCC)
        .await
        .expect("create should succeed");

    //* When
    let result = store.put(&path, b"again".to_vec(), NEW_RESOURCE_MVCC).await;

    //* Then
    assert!(
        result.is_err_and(|err| err.is_version_conflict()),
        "second create should conflict"
    );
}

#[tokio::test]
async fn list_keys_is_scoped_to_project_and_type() {
    //* Given
    let store = InMemoryResourceStore::new();
    for (project, ty, key) in [
        ("p", "widget", "b"),
        ("p", "widget", "a"),
        ("p", "gadget", "c"),
        ("q", "widget", "d"),
    ] {
        store
            .put(&ResourcePath::new(project, ty, key), Vec::new(), NEW_RESOURCE_MVCC)
            .await
            .expect("create should succeed");
    }

    //* When
    let keys = store
        .list_keys("p", "widget")
        .await
        .expect("list should succeed");

    //* Then
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn delete_is_idempotent() {
    //* Given
    let store = InMemoryResourceStore::new();
    let path = ResourcePath::new("p", "widget", "a");
    store
        .put(&path, Vec::new(), NEW_RESOURCE_MVCC)
        .await
        .expect("create should succeed");

    //* When
    store.delete(&path).await.expect("first delete should succeed");
    let second = store.delete(&path).await;

    //* Then
    assert!(second.is_ok(), "deleting a missing resource should succeed");
    assert!(store.is_empty());
}
