//! Resource store backed by an [`ObjectStore`].
//!
//! Each object holds an 8-byte big-endian mvcc header followed by the resource content. The
//! version check of `put` is delegated to the object store's conditional writes
//! ([`PutMode::Create`] for new resources, [`PutMode::Update`] keyed on the e-tag/version of the
//! object that was read), so concurrent writers in different processes are detected by the
//! object store itself. Backends without conditional update support reject every update.

use async_trait::async_trait;
use futures::TryStreamExt as _;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion, path::Path};

use crate::resource::{NEW_RESOURCE_MVCC, RawResource, ResourcePath, ResourceStore, StoreError};

const HEADER_LEN: usize = 8;

/// A [`ResourceStore`] over any object store supporting conditional puts.
#[derive(Debug, Clone)]
pub struct ObjectResourceStore<S: ObjectStore = std::sync::Arc<dyn ObjectStore>> {
    object_store: S,
}

/// A decoded object together with the version tokens needed for a conditional update.
struct VersionedObject {
    resource: RawResource,
    update_version: UpdateVersion,
}

impl<S: ObjectStore> ObjectResourceStore<S> {
    pub fn new(object_store: S) -> Self {
        Self { object_store }
    }

    async fn fetch(&self, path: &ResourcePath) -> Result<Option<VersionedObject>, StoreError> {
        let location = Path::from(path.to_string());
        let get_res = match self.object_store.get(&location).await {
            Ok(res) => res,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(source) => {
                return Err(StoreError::ObjectStore {
                    path: path.to_string(),
                    source,
                });
            }
        };

        let update_version = UpdateVersion {
            e_tag: get_res.meta.e_tag.clone(),
            version: get_res.meta.version.clone(),
        };
        let bytes = get_res
            .bytes()
            .await
            .map_err(|source| StoreError::ObjectStore {
                path: path.to_string(),
                source,
            })?;

        let resource = decode(path, &bytes)?;
        Ok(Some(VersionedObject {
            resource,
            update_version,
        }))
    }
}

#[async_trait]
impl<S: ObjectStore> ResourceStore for ObjectResourceStore<S> {
    async fn get(&self, path: &ResourcePath) -> Result<Option<RawResource>, StoreError> {
        Ok(self.fetch(path).await?.map(|obj| obj.resource))
    }

    async fn put(
        &self,
        path: &ResourcePath,
        content: Vec<u8>,
        expected_mvcc: i64,
    ) -> Result<i64, StoreError> {
        let current = self.fetch(path).await?;
        let current_mvcc = current
            .as_ref()
            .map(|obj| obj.resource.mvcc)
            .unwrap_or(NEW_RESOURCE_MVCC);
        if current_mvcc != expected_mvcc {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected: expected_mvcc,
                actual: Some(current_mvcc),
            });
        }

        let mode = match current {
            Some(obj) => PutMode::Update(obj.update_version),
            None => PutMode::Create,
        };
        let mvcc = current_mvcc + 1;
        let payload = PutPayload::from(encode(mvcc, content));
        let location = Path::from(path.to_string());

        match self
            .object_store
            .put_opts(&location, payload, PutOptions::from(mode))
            .await
        {
            Ok(_) => Ok(mvcc),
            // Another writer got in between our read and our conditional write
            Err(object_store::Error::Precondition { .. })
            | Err(object_store::Error::AlreadyExists { .. }) => Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected: expected_mvcc,
                actual: None,
            }),
            Err(source) => Err(StoreError::ObjectStore {
                path: path.to_string(),
                source,
            }),
        }
    }

    async fn delete(&self, path: &ResourcePath) -> Result<(), StoreError> {
        let location = Path::from(path.to_string());
        match self.object_store.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()), // Idempotent: not found is success
            Err(source) => Err(StoreError::ObjectStore {
                path: path.to_string(),
                source,
            }),
        }
    }

    async fn list_keys(
        &self,
        project: &str,
        resource_type: &str,
    ) -> Result<Vec<String>, StoreError> {
        let prefix = ResourcePath::type_prefix(project, resource_type);
        let prefix_path = Path::from(prefix.trim_end_matches('/'));

        let objects: Vec<_> = self
            .object_store
            .list(Some(&prefix_path))
            .try_collect()
            .await
            .map_err(|source| StoreError::ObjectStore {
                path: prefix.clone(),
                source,
            })?;

        let mut keys: Vec<String> = objects
            .iter()
            .filter_map(|meta| ResourcePath::key_from_location(&prefix, meta.location.as_ref()))
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }
}

fn encode(mvcc: i64, content: Vec<u8>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + content.len());
    buf.extend_from_slice(&mvcc.to_be_bytes());
    buf.extend_from_slice(&content);
    buf
}

fn decode(path: &ResourcePath, bytes: &[u8]) -> Result<RawResource, StoreError> {
    let Some((header, content)) = bytes.split_first_chunk::<HEADER_LEN>() else {
        return Err(StoreError::CorruptEnvelope {
            path: path.to_string(),
        });
    };
    Ok(RawResource {
        content: content.to_vec(),
        mvcc: i64::from_be_bytes(*header),
    })
}
