//! Unique identifier for metadata operations.
//!
//! Every transaction scope run is tagged with an [`OperationId`] so that the log lines of all
//! its attempts can be correlated.

use std::fmt;

/// Unique identifier for one logical metadata operation (all of its retry attempts).
///
/// Uses UUIDv7, so identifiers sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(uuid::Uuid);

impl OperationId {
    /// Create a new operation ID with the current timestamp.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<uuid::Uuid> for OperationId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}
