//! Entry point of the engine: one resource store, one configuration, and lazily created
//! per-project managers sharing the store's caches.

use std::{collections::BTreeMap, sync::Arc};

use metadata_store::ResourceStore;
use parking_lot::Mutex;

use crate::{
    config::RealizationConfig,
    details::SegmentDetailsManager,
    fragment::LayoutFragmentManager,
    manager::DataflowManager,
    model::{IndexPlanManager, ModelManager},
};

#[derive(Debug, Clone)]
pub struct MetadataContext {
    store: Arc<dyn ResourceStore>,
    config: Arc<RealizationConfig>,
    projects: Arc<Mutex<BTreeMap<String, DataflowManager>>>,
}

impl MetadataContext {
    pub fn new(store: Arc<dyn ResourceStore>, config: RealizationConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            projects: Default::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn config(&self) -> &RealizationConfig {
        &self.config
    }

    /// The dataflow manager of `project`. Repeated calls return managers sharing one cache.
    pub fn dataflow_manager(&self, project: &str) -> DataflowManager {
        let mut projects = self.projects.lock();
        if let Some(manager) = projects.get(project) {
            return manager.clone();
        }

        tracing::debug!(project, "creating project managers");
        let manager = DataflowManager::new(
            project,
            Arc::clone(&self.store),
            Arc::clone(&self.config),
        );
        projects.insert(project.to_string(), manager.clone());
        manager
    }

    pub fn model_manager(&self, project: &str) -> ModelManager {
        self.dataflow_manager(project).models().clone()
    }

    pub fn index_plan_manager(&self, project: &str) -> IndexPlanManager {
        self.dataflow_manager(project).index_plans().clone()
    }

    pub fn segment_details_manager(&self, project: &str) -> SegmentDetailsManager {
        self.dataflow_manager(project).segment_details().clone()
    }

    pub fn layout_fragment_manager(&self, project: &str) -> LayoutFragmentManager {
        self.dataflow_manager(project).layout_fragments().clone()
    }

    /// Forgets the cached managers of `project`, e.g. after the project was deleted.
    pub fn evict_project(&self, project: &str) {
        self.projects.lock().remove(project);
    }
}
