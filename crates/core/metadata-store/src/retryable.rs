//! Classification of errors as retryable or fatal.

use crate::{cache::CrudError, resource::StoreError};

/// Extension trait for errors that can be classified as retryable or fatal.
///
/// Only optimistic concurrency conflicts are retryable: re-running the unit of work against
/// freshly loaded state may succeed. Everything else propagates on the first occurrence.
pub trait RetryableErrorExt: std::error::Error {
    /// Returns `true` if re-running the failed unit of work may succeed.
    fn is_retryable(&self) -> bool;

    /// Returns `true` if the error must be propagated immediately.
    fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }
}

impl RetryableErrorExt for StoreError {
    fn is_retryable(&self) -> bool {
        self.is_version_conflict()
    }
}

impl RetryableErrorExt for CrudError {
    fn is_retryable(&self) -> bool {
        match self {
            CrudError::Store(err) => err.is_retryable(),
            CrudError::Serialize { .. } | CrudError::SharedEntity(_) => false,
        }
    }
}
