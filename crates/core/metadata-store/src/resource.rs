//! Versioned resource store interface.
//!
//! A resource store maps a [`ResourcePath`] to a byte blob plus a monotonic version counter
//! (`mvcc`). Writers state the version they read; a write against any other version is
//! rejected with [`StoreError::VersionConflict`]. This is the only concurrency primitive the
//! metadata engine relies on.

use std::fmt::{self, Debug, Display};

use async_trait::async_trait;

/// Version passed as `expected_mvcc` when creating a resource that must not exist yet.
pub const NEW_RESOURCE_MVCC: i64 = -1;

/// Location of a persisted resource: `{project}/{resource_type}/{key}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourcePath {
    project: String,
    resource_type: &'static str,
    key: String,
}

impl ResourcePath {
    pub fn new(project: impl Into<String>, resource_type: &'static str, key: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            resource_type,
            key: key.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn resource_type(&self) -> &'static str {
        self.resource_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Directory prefix shared by every resource of the same project and type.
    pub fn type_prefix(project: &str, resource_type: &str) -> String {
        format!("{project}/{resource_type}/")
    }

    /// Extracts the resource key from a full location string under `prefix`.
    pub(crate) fn key_from_location<'a>(prefix: &str, location: &'a str) -> Option<&'a str> {
        location
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(".json"))
            .filter(|key| !key.is_empty() && !key.contains('/'))
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}.json", self.project, self.resource_type, self.key)
    }
}

/// A resource as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResource {
    pub content: Vec<u8>,
    pub mvcc: i64,
}

/// Key/path addressed store of versioned byte blobs.
///
/// Implementations must make `put` atomic with respect to the version check: of two writers
/// presenting the same `expected_mvcc`, exactly one succeeds.
#[async_trait]
pub trait ResourceStore: Debug + Send + Sync {
    /// Reads a resource. Returns `None` if the path does not exist.
    async fn get(&self, path: &ResourcePath) -> Result<Option<RawResource>, StoreError>;

    /// Writes a resource if its current version equals `expected_mvcc`
    /// ([`NEW_RESOURCE_MVCC`] for a resource that must not exist yet).
    ///
    /// Returns the new version.
    async fn put(
        &self,
        path: &ResourcePath,
        content: Vec<u8>,
        expected_mvcc: i64,
    ) -> Result<i64, StoreError>;

    /// Deletes a resource.
    ///
    /// This operation is idempotent: deleting a non-existent resource succeeds silently.
    async fn delete(&self, path: &ResourcePath) -> Result<(), StoreError>;

    /// Lists the keys of every resource of `resource_type` in `project`, sorted.
    async fn list_keys(&self, project: &str, resource_type: &str)
    -> Result<Vec<String>, StoreError>;
}

/// Errors returned by [`ResourceStore`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The resource changed since the writer read it.
    ///
    /// `actual` is [`NEW_RESOURCE_MVCC`] when the resource does not exist, and `None` when the
    /// backend only reports that its precondition failed.
    #[error("version conflict on {path}: expected mvcc {expected}, found {}", display_actual(.actual))]
    VersionConflict {
        path: String,
        expected: i64,
        actual: Option<i64>,
    },

    /// The stored bytes do not carry a valid version header.
    #[error("corrupt resource envelope at {path}")]
    CorruptEnvelope { path: String },

    /// The underlying object store failed.
    #[error("object store operation on {path} failed")]
    ObjectStore {
        path: String,
        #[source]
        source: object_store::Error,
    },
}

fn display_actual(actual: &Option<i64>) -> String {
    match actual {
        Some(mvcc) => mvcc.to_string(),
        None => "a newer version".to_string(),
    }
}

impl StoreError {
    /// Returns `true` if the error is an optimistic concurrency conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}
