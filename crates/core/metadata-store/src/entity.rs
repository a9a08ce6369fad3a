//! Cached entity envelope and the [`Entity`] trait.
//!
//! Every persisted entity carries an [`Envelope`]: the version counter (`mvcc`) of the store
//! revision it was read from, plus two transient flags that are never serialized:
//!
//! - `cached_and_shared`: set on instances handed out by the cache. Mutators must call
//!   [`Envelope::check_writable`] first and fail with [`SharedEntityError`] on such instances.
//! - `broken`: set on placeholders for resources that could not be read or whose dependencies
//!   are missing.
//!
//! [`Entity::copy_for_write`] is the only sanctioned way to obtain a mutable instance.

use serde::{Serialize, de::DeserializeOwned};

use crate::resource::NEW_RESOURCE_MVCC;

/// Bookkeeping attached to every entity instance. Entities hold it as a `#[serde(skip)]` field:
/// the authoritative version lives in the store, next to the serialized content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    mvcc: i64,
    cached_and_shared: bool,
    broken: bool,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            mvcc: NEW_RESOURCE_MVCC,
            cached_and_shared: false,
            broken: false,
        }
    }
}

impl Envelope {
    /// Version of the store revision this instance was read from, or
    /// [`NEW_RESOURCE_MVCC`] if it was never persisted.
    pub fn mvcc(&self) -> i64 {
        self.mvcc
    }

    pub fn is_cached_and_shared(&self) -> bool {
        self.cached_and_shared
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn set_broken(&mut self, broken: bool) {
        self.broken = broken;
    }

    pub(crate) fn set_mvcc(&mut self, mvcc: i64) {
        self.mvcc = mvcc;
    }

    pub(crate) fn mark_shared(&mut self) {
        self.cached_and_shared = true;
    }

    pub(crate) fn mark_private(&mut self) {
        self.cached_and_shared = false;
    }

    /// Fails if this instance is shared through the cache and therefore immutable.
    pub fn check_writable(
        &self,
        resource_type: &'static str,
        key: &str,
    ) -> Result<(), SharedEntityError> {
        if self.cached_and_shared {
            return Err(SharedEntityError {
                resource_type,
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

/// A persisted, cacheable metadata entity.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Resource type tag, used as the directory name in the store.
    const RESOURCE_TYPE: &'static str;

    /// Key of this entity within its project and type.
    fn resource_key(&self) -> String;

    fn envelope(&self) -> &Envelope;

    fn envelope_mut(&mut self) -> &mut Envelope;

    /// Builds the placeholder used when the resource at `key` cannot be read.
    fn broken_placeholder(project: &str, key: &str) -> Self;

    /// Clears lazily derived state that must not survive into a private copy.
    fn reset_transient(&mut self) {}

    fn mvcc(&self) -> i64 {
        self.envelope().mvcc()
    }

    fn is_broken(&self) -> bool {
        self.envelope().is_broken()
    }

    /// Fails with [`SharedEntityError`] if this instance came from the cache.
    fn check_writable(&self) -> Result<(), SharedEntityError> {
        self.envelope()
            .check_writable(Self::RESOURCE_TYPE, &self.resource_key())
    }

    /// Re-targets a private copy at version `mvcc`.
    ///
    /// Used by retried units of work that re-save an entity they already committed in an
    /// earlier attempt.
    fn rebase(&mut self, mvcc: i64) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.envelope_mut().set_mvcc(mvcc);
        Ok(())
    }

    /// Returns a private, mutable deep copy carrying the same version counter.
    fn copy_for_write(&self) -> Self {
        let mut copy = self.clone();
        copy.envelope_mut().mark_private();
        copy.reset_transient();
        copy
    }
}

/// An attempt to mutate an entity instance shared through the cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "cannot modify cached and shared {resource_type} '{key}', obtain a private copy with copy_for_write first"
)]
pub struct SharedEntityError {
    pub resource_type: &'static str,
    pub key: String,
}
