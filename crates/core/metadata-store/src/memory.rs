//! In-process resource store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::resource::{NEW_RESOURCE_MVCC, RawResource, ResourcePath, ResourceStore, StoreError};

/// A [`ResourceStore`] holding every resource in memory.
///
/// All operations take a single mutex, which makes the version check and the write of `put`
/// one atomic step. Intended for tests and for embedding the engine in a single process.
#[derive(Debug, Default)]
pub struct InMemoryResourceStore {
    resources: Mutex<BTreeMap<String, RawResource>>,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resources currently stored.
    pub fn len(&self) -> usize {
        self.resources.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.lock().is_empty()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn get(&self, path: &ResourcePath) -> Result<Option<RawResource>, StoreError> {
        Ok(self.resources.lock().get(&path.to_string()).cloned())
    }

    async fn put(
        &self,
        path: &ResourcePath,
        content: Vec<u8>,
        expected_mvcc: i64,
    ) -> Result<i64, StoreError> {
        let location = path.to_string();
        let mut resources = self.resources.lock();

        let current = resources
            .get(&location)
            .map(|res| res.mvcc)
            .unwrap_or(NEW_RESOURCE_MVCC);
        if current != expected_mvcc {
            return Err(StoreError::VersionConflict {
                path: location,
                expected: expected_mvcc,
                actual: Some(current),
            });
        }

        let mvcc = current + 1;
        resources.insert(location, RawResource { content, mvcc });
        Ok(mvcc)
    }

    async fn delete(&self, path: &ResourcePath) -> Result<(), StoreError> {
        self.resources.lock().remove(&path.to_string());
        Ok(())
    }

    async fn list_keys(
        &self,
        project: &str,
        resource_type: &str,
    ) -> Result<Vec<String>, StoreError> {
        let prefix = ResourcePath::type_prefix(project, resource_type);
        let resources = self.resources.lock();
        let keys = resources
            .range(prefix.clone()..)
            .take_while(|(location, _)| location.starts_with(&prefix))
            .filter_map(|(location, _)| ResourcePath::key_from_location(&prefix, location))
            .map(str::to_string)
            .collect();
        Ok(keys)
    }
}
