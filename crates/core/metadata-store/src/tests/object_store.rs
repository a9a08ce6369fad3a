use std::sync::Arc;

use object_store::{ObjectStore, PutPayload, memory::InMemory, path::Path};

use crate::{NEW_RESOURCE_MVCC, ObjectResourceStore, ResourcePath, ResourceStore, StoreError};

fn object_backed_store() -> (Arc<dyn ObjectStore>, ObjectResourceStore) {
    let inner: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    (Arc::clone(&inner), ObjectResourceStore::new(inner))
}

#[tokio::test]
async fn put_and_get_round_trip_versions() {
    //* Given
    let (_, store) = object_backed_store();
    let path = ResourcePath::new("p", "widget", "a");

    //* When
    let v0 = store
        .put(&path, b"{\"v\":1}".to_vec(), NEW_RESOURCE_MVCC)
        .await
        .expect("create should succeed");
    let v1 = store
        .put(&path, b"{\"v\":2}".to_vec(), v0)
        .await
        .expect("update should succeed");

    //* Then
    assert_eq!((v0, v1), (0, 1));
    let raw = store
        .get(&path)
        .await
        .expect("get should succeed")
        .expect("resource should exist");
    assert_eq!(raw.content, b"{\"v\":2}");
    assert_eq!(raw.mvcc, 1);
}

#[tokio::test]
async fn stale_and_duplicate_writes_conflict() {
    //* Given
    let (_, store) = object_backed_store();
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
    let stale = store.put(&path, b"stale".to_vec(), v0).await;
    let duplicate = store.put(&path, b"dup".to_vec(), NEW_RESOURCE_MVCC).await;

    //* Then
    assert!(
        stale.is_err_and(|err| err.is_version_conflict()),
        "stale update should conflict"
    );
    assert!(
        duplicate.is_err_and(|err| err.is_version_conflict()),
        "create over an existing object should conflict"
    );
}

#[tokio::test]
async fn list_keys_ignores_foreign_objects() {
    //* Given
    let (inner, store) = object_backed_store();
    for key in ["b", "a"] {
        store
            .put(&ResourcePath::new("p", "widget", key), Vec::new(), NEW_RESOURCE_MVCC)
            .await
            .expect("create should succeed");
    }
    inner
        .put(&Path::from("p/widget/readme.txt"), PutPayload::from_static(b"x"))
        .await
        .expect("raw put should succeed");

    //* When
    let keys = store
        .list_keys("p", "widget")
        .await
        .expect("list should succeed");

    //* Then
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn object_without_header_is_reported_corrupt() {
    //* Given
    let (inner, store) = object_backed_store();
    inner
        .put(&Path::from("p/widget/short.json"), PutPayload::from_static(b"abc"))
        .await
        .expect("raw put should succeed");

    //* When
    let result = store.get(&ResourcePath::new("p", "widget", "short")).await;

    //* Then
    assert!(
        matches!(result, Err(StoreError::CorruptEnvelope { .. })),
        "expected corrupt envelope, got {result:?}"
    );
}

#[tokio::test]
async fn delete_missing_object_succeeds() {
    //* Given
    let (_, store) = object_backed_store();

    //* When
    let result = store.delete(&ResourcePath::new("p", "widget", "nope")).await;

    //* Then
    assert!(result.is_ok(), "delete of a missing object should succeed");
}
