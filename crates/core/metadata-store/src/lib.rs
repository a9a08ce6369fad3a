//! Versioned resource storage and the cached CRUD layer for metadata entities.
//!
//! - [`ResourceStore`]: key/path addressed byte blobs with optimistic version checks
//! - [`CachedCrud`]: per-type, per-project cache of deserialized [`Entity`] instances
//! - [`TransactionScope`]: retries a unit of work on version conflicts

pub mod cache;
pub mod entity;
pub mod memory;
pub mod object;
pub mod resource;
pub mod retryable;
pub mod txn;

pub use self::{
    cache::{CachedCrud, CrudError, EntityInitHook},
    entity::{Entity, Envelope, SharedEntityError},
    memory::InMemoryResourceStore,
    object::ObjectResourceStore,
    resource::{NEW_RESOURCE_MVCC, RawResource, ResourcePath, ResourceStore, StoreError},
    retryable::RetryableErrorExt,
    txn::{RetriesExhausted, RetryPolicy, TransactionScope},
};

#[cfg(test)]
mod tests {
    mod cache;
    mod fixtures;
    mod memory_store;
    mod object_store;
    mod txn;
}
