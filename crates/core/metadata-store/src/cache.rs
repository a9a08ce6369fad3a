//! Cached CRUD access to the entities of one type within one project.
//!
//! ## Caching Mechanism
//!
//! - **Lazy Loading**: every resource of the type is loaded on first access
//! - **Read-Through**: a cache miss falls back to the store for that key
//! - **Write-Through**: `save()` and `delete()` update the store first and the cache second
//! - **Shared Instances**: cached entities are handed out as `Arc<T>` flagged
//!   cached-and-shared; writers obtain a private copy with [`Entity::copy_for_write`]
//! - **Conflict Refresh**: a version conflict on save reloads the key, so that the next attempt
//!   of the enclosing transaction starts from the committed state
//!
//! Reads may be one transaction behind a concurrent writer in another process
//! (read-committed). A cached instance is never replaced by an older version.

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use monitoring::logging;
use parking_lot::RwLock;
use tokio::sync::OnceCell;

use crate::{
    entity::{Entity, SharedEntityError},
    resource::{ResourcePath, ResourceStore, StoreError},
};

/// Post-load hook, applied identically on cache warm-up, single-key reload and save, so that
/// instances obtained either way are indistinguishable.
///
/// Hooks resolve derived state (e.g. marking an entity broken when a dependency is missing)
/// and must not fail: missing dependencies degrade the entity instead.
#[async_trait]
pub trait EntityInitHook<T>: Send + Sync {
    async fn after_load(&self, entity: &mut T);
}

pub struct CachedCrud<T: Entity> {
    project: String,
    store: Arc<dyn ResourceStore>,
    cache: Arc<RwLock<BTreeMap<String, Arc<T>>>>,
    warmed_up: Arc<OnceCell<()>>,
    init_hook: Option<Arc<dyn EntityInitHook<T>>>,
}

impl<T: Entity> Clone for CachedCrud<T> {
    fn clone(&self) -> Self {
        Self {
            project: self.project.clone(),
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            warmed_up: Arc::clone(&self.warmed_up),
            init_hook: self.init_hook.clone(),
        }
    }
}

impl<T: Entity> fmt::Debug for CachedCrud<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedCrud")
            .field("project", &self.project)
            .field("resource_type", &T::RESOURCE_TYPE)
            .field("cached", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

impl<T: Entity> CachedCrud<T> {
    /// Creates a cache over `store` for the entities of `project`. The cache starts empty.
    pub fn new(project: impl Into<String>, store: Arc<dyn ResourceStore>) -> Self {
        Self {
            project: project.into(),
            store,
            cache: Default::default(),
            warmed_up: Default::default(),
            init_hook: None,
        }
    }

    /// Installs the post-load hook. Must be called before the first access.
    pub fn with_init_hook(mut self, hook: Arc<dyn EntityInitHook<T>>) -> Self {
        self.init_hook = Some(hook);
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Returns the shared instance for `key`, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<Arc<T>>, CrudError> {
        self.ensure_warmed_up().await?;

        if let Some(entity) = self.cache.read().get(key) {
            return Ok(Some(Arc::clone(entity)));
        }

        // Created by another process since the warm-up
        self.reload(key).await
    }

    /// Returns the shared instances matching `predicate`, in key order.
    ///
    /// Broken entities are excluded unless `include_broken` is set.
    pub async fn list(
        &self,
        include_broken: bool,
        predicate: impl Fn(&T) -> bool,
    ) -> Result<Vec<Arc<T>>, CrudError> {
        self.ensure_warmed_up().await?;

        let cache = self.cache.read();
        Ok(cache
            .values()
            .filter(|entity| include_broken || !entity.is_broken())
            .filter(|entity| predicate(entity))
            .cloned()
            .collect())
    }

    /// Returns every shared instance, excluding broken ones unless `include_broken` is set.
    pub async fn list_all(&self, include_broken: bool) -> Result<Vec<Arc<T>>, CrudError> {
        self.list(include_broken, |_| true).await
    }

    /// Returns a private, mutable deep copy of `entity`.
    pub fn copy_for_write(&self, entity: &T) -> T {
        entity.copy_for_write()
    }

    /// Persists a private copy, checking its version against the store.
    ///
    /// On success the entity is re-initialized through the post-load hook, frozen and cached,
    /// and the shared instance is returned. On a version conflict the cached entry is refreshed
    /// and [`StoreError::VersionConflict`] is returned.
    pub async fn save(&self, mut entity: T) -> Result<Arc<T>, CrudError> {
        entity.check_writable()?;

        let key = entity.resource_key();
        let path = self.path(&key);
        let content = serde_json::to_vec(&entity).map_err(|source| CrudError::Serialize {
            path: path.to_string(),
            source,
        })?;

        match self.store.put(&path, content, entity.mvcc()).await {
            Ok(mvcc) => {
                entity.envelope_mut().set_mvcc(mvcc);
                entity.envelope_mut().set_broken(false);
                self.run_init_hook(&mut entity).await;
                entity.envelope_mut().mark_shared();

                tracing::debug!(
                    resource = %path,
                    mvcc,
                    "saved resource"
                );

                Ok(self.insert_if_newer(Arc::new(entity)))
            }
            Err(err) if err.is_version_conflict() => {
                tracing::debug!(
                    resource = %path,
                    error = %err,
                    "version conflict on save, refreshing cached entry"
                );
                if let Err(reload_err) = self.reload(&key).await {
                    tracing::warn!(
                        resource = %path,
                        error = %reload_err, error_source = logging::error_source(&reload_err),
                        "failed to refresh cached entry after version conflict"
                    );
                }
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes `entity` from the store and the cache.
    pub async fn delete(&self, entity: &T) -> Result<(), CrudError> {
        self.delete_by_key(&entity.resource_key()).await
    }

    /// Deletes the resource at `key` from the store and the cache.
    ///
    /// This operation is idempotent: deleting a non-existent resource succeeds silently.
    pub async fn delete_by_key(&self, key: &str) -> Result<(), CrudError> {
        let path = self.path(key);
        self.store.delete(&path).await?;
        self.cache.write().remove(key);

        tracing::debug!(resource = %path, "deleted resource");
        Ok(())
    }

    /// Re-reads `key` from the store and replaces the cached entry, unless a newer version was
    /// cached while the read was in flight.
    pub async fn reload(&self, key: &str) -> Result<Option<Arc<T>>, CrudError> {
        match self.load(key).await? {
            Some(entity) => Ok(Some(self.insert_if_newer(Arc::new(entity)))),
            None => {
                self.cache.write().remove(key);
                Ok(None)
            }
        }
    }

    /// Re-reads every resource of this type from the store, replacing the cache contents.
    ///
    /// Resources that fail to load are logged and skipped.
    pub async fn reload_all(&self) -> Result<(), CrudError> {
        let keys = self
            .store
            .list_keys(&self.project, T::RESOURCE_TYPE)
            .await?;

        let mut entities = BTreeMap::new();
        let mut failed_count = 0;
        for key in &keys {
            match self.load(key).await {
                Ok(Some(entity)) => {
                    entities.insert(key.clone(), Arc::new(entity));
                }
                // Deleted between listing and loading
                Ok(None) => {}
                Err(err) => {
                    failed_count += 1;
                    tracing::warn!(
                        resource = %self.path(key),
                        error = %err, error_source = logging::error_source(&err),
                        "failed to load resource, skipping"
                    );
                }
            }
        }

        tracing::debug!(
            project = %self.project,
            resource_type = T::RESOURCE_TYPE,
            loaded = entities.len(),
            failed = failed_count,
            "reloaded resource cache"
        );

        *self.cache.write() = entities;
        // A concurrent warm-up may have finished first; either way the cache is populated
        let _ = self.warmed_up.set(());
        Ok(())
    }

    async fn ensure_warmed_up(&self) -> Result<(), CrudError> {
        self.warmed_up
            .get_or_try_init(|| async {
                let keys = self
                    .store
                    .list_keys(&self.project, T::RESOURCE_TYPE)
                    .await?;
                for key in keys {
                    match self.load(&key).await {
                        Ok(Some(entity)) => {
                            self.insert_if_newer(Arc::new(entity));
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(
                                resource = %self.path(&key),
                                error = %err, error_source = logging::error_source(&err),
                                "failed to load resource during warm-up, skipping"
                            );
                        }
                    }
                }
                Ok::<_, CrudError>(())
            })
            .await?;
        Ok(())
    }

    /// Reads and deserializes one resource. Unparsable content yields a broken placeholder.
    async fn load(&self, key: &str) -> Result<Option<T>, CrudError> {
        let path = self.path(key);
        let Some(raw) = self.store.get(&path).await? else {
            return Ok(None);
        };

        let mut entity = match serde_json::from_slice::<T>(&raw.content) {
            Ok(entity) => entity,
            Err(err) => {
                tracing::warn!(
                    resource = %path,
                    error = %err,
                    "unreadable resource, registering broken placeholder"
                );
                let mut placeholder = T::broken_placeholder(&self.project, key);
                placeholder.envelope_mut().set_broken(true);
                placeholder
            }
        };
        entity.envelope_mut().set_mvcc(raw.mvcc);
        self.run_init_hook(&mut entity).await;
        entity.envelope_mut().mark_shared();

        Ok(Some(entity))
    }

    async fn run_init_hook(&self, entity: &mut T) {
        if let Some(hook) = &self.init_hook {
            hook.after_load(entity).await;
        }
    }

    fn insert_if_newer(&self, entity: Arc<T>) -> Arc<T> {
        let key = entity.resource_key();
        let mut cache = self.cache.write();
        match cache.get(&key) {
            Some(existing) if existing.mvcc() > entity.mvcc() => Arc::clone(existing),
            _ => {
                cache.insert(key, Arc::clone(&entity));
                entity
            }
        }
    }

    fn path(&self, key: &str) -> ResourcePath {
        ResourcePath::new(self.project.clone(), T::RESOURCE_TYPE, key)
    }
}

/// Errors returned by [`CachedCrud`] operations.
#[derive(Debug, thiserror::Error)]
pub enum CrudError {
    /// The resource store rejected or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The entity could not be serialized.
    #[error("failed to serialize resource {path}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A cached and shared instance was passed where a private copy is required.
    #[error(transparent)]
    SharedEntity(#[from] SharedEntityError),
}

impl CrudError {
    /// Returns `true` if the error is an optimistic concurrency conflict.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, CrudError::Store(err) if err.is_version_conflict())
    }
}
