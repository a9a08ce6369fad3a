//! Data models and index plans, the two collaborators a dataflow is derived from.
//!
//! Only the parts the realization engine consults are modelled: the partition column, the
//! multi-partition values, the storage type, and the set of layouts an index plan defines.

use std::{collections::BTreeSet, sync::Arc};

use metadata_store::{CachedCrud, Entity, Envelope, ResourceStore, SharedEntityError};

use crate::{
    error::{Error, Result},
    ids::{LayoutId, ModelId, PartitionId},
};

/// How a model's layouts are physically stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// One set of files per segment and layout.
    #[default]
    Standard,
    /// Layout files shared across segments, tracked by layout fragment details.
    Layered,
}

/// A value list of a multi-partitioned model, e.g. `["us", "2024"]`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartitionValue {
    pub id: PartitionId,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MultiPartitionDesc {
    pub columns: Vec<String>,
    #[serde(default)]
    pub partitions: Vec<PartitionValue>,
    /// Highest id handed out so far, ids are never reused.
    #[serde(default = "no_partition_id")]
    pub max_partition_id: PartitionId,
}

fn no_partition_id() -> PartitionId {
    -1
}

impl MultiPartitionDesc {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            partitions: Vec::new(),
            max_partition_id: no_partition_id(),
        }
    }

    pub fn partition_by_values(&self, values: &[String]) -> Option<&PartitionValue> {
        self.partitions.iter().find(|p| p.values == values)
    }

    pub fn partition_ids(&self) -> BTreeSet<PartitionId> {
        self.partitions.iter().map(|p| p.id).collect()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DataModel {
    id: ModelId,
    alias: String,
    #[serde(default)]
    partition_column: Option<String>,
    #[serde(default)]
    multi_partition: Option<MultiPartitionDesc>,
    #[serde(default)]
    storage_type: StorageType,
    #[serde(skip)]
    envelope: Envelope,
}

impl DataModel {
    pub fn new(id: ModelId, alias: impl Into<String>) -> Self {
        Self {
            id,
            alias: alias.into(),
            partition_column: None,
            multi_partition: None,
            storage_type: StorageType::Standard,
            envelope: Envelope::default(),
        }
    }

    pub fn with_partition_column(mut self, column: impl Into<String>) -> Self {
        self.partition_column = Some(column.into());
        self
    }

    pub fn with_multi_partition(mut self, columns: Vec<String>) -> Self {
        self.multi_partition = Some(MultiPartitionDesc::new(columns));
        self
    }

    pub fn with_storage_type(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn partition_column(&self) -> Option<&str> {
        self.partition_column.as_deref()
    }

    pub fn has_partition_column(&self) -> bool {
        self.partition_column.is_some()
    }

    pub fn multi_partition(&self) -> Option<&MultiPartitionDesc> {
        self.multi_partition.as_ref()
    }

    pub fn is_multi_partitioned(&self) -> bool {
        self.multi_partition.is_some()
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn is_layered(&self) -> bool {
        self.storage_type == StorageType::Layered
    }

    /// Resolves value lists to partition ids, failing on any value list the model does not know.
    pub fn resolve_partitions(&self, values: &[Vec<String>]) -> Result<Vec<PartitionId>> {
        let desc = self
            .multi_partition
            .as_ref()
            .ok_or(Error::NotMultiPartitioned(self.id))?;

        let mut ids = Vec::with_capacity(values.len());
        let mut unknown = Vec::new();
        for value in values {
            match desc.partition_by_values(value) {
                Some(partition) => ids.push(partition.id),
                None => unknown.push(value.clone()),
            }
        }
        if !unknown.is_empty() {
            return Err(Error::UnknownPartitionValues {
                model: self.id,
                values: unknown,
            });
        }
        Ok(ids)
    }

    /// Registers new value lists, allocating ids. Known value lists keep their id.
    pub fn add_partition_values(&mut self, values: &[Vec<String>]) -> Result<Vec<PartitionId>> {
        self.check_writable()?;
        let id = self.id;
        let desc = self
            .multi_partition
            .as_mut()
            .ok_or(Error::NotMultiPartitioned(id))?;

        let mut ids = Vec::with_capacity(values.len());
        for value in values {
            if let Some(partition) = desc.partition_by_values(value) {
                ids.push(partition.id);
                continue;
            }
            desc.max_partition_id += 1;
            desc.partitions.push(PartitionValue {
                id: desc.max_partition_id,
                values: value.clone(),
            });
            ids.push(desc.max_partition_id);
        }
        Ok(ids)
    }
}

impl Entity for DataModel {
    const RESOURCE_TYPE: &'static str = "model";

    fn resource_key(&self) -> String {
        self.id.to_string()
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn broken_placeholder(_project: &str, key: &str) -> Self {
        Self::new(key.parse().unwrap_or_else(|_| ModelId::nil()), key)
    }
}

/// The set of layouts defined for a model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IndexPlan {
    id: ModelId,
    #[serde(default)]
    layouts: BTreeSet<LayoutId>,
    /// Layouts scheduled for deletion, pruned once no segment materializes them anymore.
    #[serde(default)]
    to_be_deleted: BTreeSet<LayoutId>,
    #[serde(skip)]
    envelope: Envelope,
}

impl IndexPlan {
    pub fn new(id: ModelId, layouts: impl IntoIterator<Item = LayoutId>) -> Self {
        Self {
            id,
            layouts: layouts.into_iter().collect(),
            to_be_deleted: BTreeSet::new(),
            envelope: Envelope::default(),
        }
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn layouts(&self) -> &BTreeSet<LayoutId> {
        &self.layouts
    }

    pub fn to_be_deleted(&self) -> &BTreeSet<LayoutId> {
        &self.to_be_deleted
    }

    pub fn add_layouts(
        &mut self,
        ids: impl IntoIterator<Item = LayoutId>,
    ) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.layouts.extend(ids);
        Ok(())
    }

    pub fn mark_to_be_deleted(
        &mut self,
        ids: impl IntoIterator<Item = LayoutId>,
    ) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        let ids: Vec<_> = ids.into_iter().filter(|id| self.layouts.contains(id)).collect();
        self.to_be_deleted.extend(ids);
        Ok(())
    }

    /// Removes layout definitions. Returns `true` if any layout was removed.
    pub fn remove_layouts(&mut self, ids: &BTreeSet<LayoutId>) -> Result<bool, SharedEntityError> {
        self.check_writable()?;
        let before = self.layouts.len();
        self.layouts.retain(|id| !ids.contains(id));
        self.to_be_deleted.retain(|id| !ids.contains(id));
        Ok(self.layouts.len() != before)
    }
}

impl Entity for IndexPlan {
    const RESOURCE_TYPE: &'static str = "index_plan";

    fn resource_key(&self) -> String {
        self.id.to_string()
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn broken_placeholder(_project: &str, key: &str) -> Self {
        Self::new(key.parse().unwrap_or_else(|_| ModelId::nil()), [])
    }
}

#[derive(Debug, Clone)]
pub struct ModelManager {
    crud: CachedCrud<DataModel>,
}

impl ModelManager {
    pub fn new(project: impl Into<String>, store: Arc<dyn ResourceStore>) -> Self {
        Self {
            crud: CachedCrud::new(project, store),
        }
    }

    /// Returns the model, or `None` if it is missing or unreadable.
    pub async fn get(&self, id: ModelId) -> Result<Option<Arc<DataModel>>> {
        let model = self.crud.get(&id.to_string()).await?;
        Ok(model.filter(|model| !model.is_broken()))
    }

    pub async fn list(&self) -> Result<Vec<Arc<DataModel>>> {
        Ok(self.crud.list_all(false).await?)
    }

    pub async fn save(&self, model: DataModel) -> Result<Arc<DataModel>> {
        let saved = self.crud.save(model).await?;
        tracing::debug!(model_id = %saved.id(), alias = saved.alias(), "saved model");
        Ok(saved)
    }

    pub async fn delete(&self, id: ModelId) -> Result<()> {
        Ok(self.crud.delete_by_key(&id.to_string()).await?)
    }

    pub fn copy_for_write(&self, model: &DataModel) -> DataModel {
        self.crud.copy_for_write(model)
    }

    pub(crate) fn crud(&self) -> &CachedCrud<DataModel> {
        &self.crud
    }

    /// Registers multi-partition value lists on the model, returning their ids.
    pub async fn add_partition_values(
        &self,
        id: ModelId,
        values: &[Vec<String>],
    ) -> Result<Vec<PartitionId>> {
        let model = self.get(id).await?.ok_or(Error::ModelNotFound(id))?;
        let mut copy = self.copy_for_write(&model);
        let ids = copy.add_partition_values(values)?;
        self.save(copy).await?;
        Ok(ids)
    }
}

#[derive(Debug, Clone)]
pub struct IndexPlanManager {
    crud: CachedCrud<IndexPlan>,
}

impl IndexPlanManager {
    pub fn new(project: impl Into<String>, store: Arc<dyn ResourceStore>) -> Self {
        Self {
            crud: CachedCrud::new(project, store),
        }
    }

    /// Returns the index plan, or `None` if it is missing or unreadable.
    pub async fn get(&self, id: ModelId) -> Result<Option<Arc<IndexPlan>>> {
        let plan = self.crud.get(&id.to_string()).await?;
        Ok(plan.filter(|plan| !plan.is_broken()))
    }

    pub async fn save(&self, plan: IndexPlan) -> Result<Arc<IndexPlan>> {
        Ok(self.crud.save(plan).await?)
    }

    pub async fn delete(&self, id: ModelId) -> Result<()> {
        Ok(self.crud.delete_by_key(&id.to_string()).await?)
    }

    pub fn copy_for_write(&self, plan: &IndexPlan) -> IndexPlan {
        self.crud.copy_for_write(plan)
    }

    pub(crate) fn crud(&self) -> &CachedCrud<IndexPlan> {
        &self.crud
    }

    /// Removes layout definitions from the index plan, if it still defines any of them.
    pub async fn remove_layouts(&self, id: ModelId, layouts: &BTreeSet<LayoutId>) -> Result<()> {
        let Some(plan) = self.get(id).await? else {
            return Err(Error::IndexPlanNotFound(id));
        };
        let mut copy = self.copy_for_write(&plan);
        if copy.remove_layouts(layouts)? {
            self.save(copy).await?;
            tracing::info!(index_plan_id = %id, ?layouts, "pruned layouts from index plan");
        }
        Ok(())
    }
}
