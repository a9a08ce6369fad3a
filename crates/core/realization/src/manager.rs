//! The dataflow manager: registry of the realizations of one project.
//!
//! Every mutation runs inside the manager's [`TransactionScope`]: it loads fresh state, applies
//! the change to private copies, and writes with version checks, starting over on conflict.
//! Mutation bodies may therefore run several times and keep their side effects idempotent.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use metadata_store::{CachedCrud, Entity, ResourceStore, TransactionScope};

use crate::{
    config::RealizationConfig,
    dataflow::{Dataflow, DataflowInitHook, DataflowStatus},
    details::SegmentDetailsManager,
    error::{Error, Result},
    fragment::LayoutFragmentManager,
    ids::{LayoutId, ModelId, PartitionId, SegmentId},
    layout::LayoutIndex,
    model::{DataModel, IndexPlanManager, ModelManager},
    range::SegmentRange,
    segment::{Segment, SegmentInitHook, SegmentStatus},
    segments,
    update::{DataflowUpdate, SavedVersions},
};

#[derive(Debug, Clone)]
pub struct DataflowManager {
    project: String,
    pub(crate) config: Arc<RealizationConfig>,
    pub(crate) txn: TransactionScope,
    pub(crate) dataflows: CachedCrud<Dataflow>,
    pub(crate) segments: CachedCrud<Segment>,
    pub(crate) details: SegmentDetailsManager,
    pub(crate) fragments: LayoutFragmentManager,
    pub(crate) models: ModelManager,
    pub(crate) index_plans: IndexPlanManager,
}

impl DataflowManager {
    /// Creates the manager of `project` together with the managers it depends on.
    pub fn new(
        project: impl Into<String>,
        store: Arc<dyn ResourceStore>,
        config: Arc<RealizationConfig>,
    ) -> Self {
        let project = project.into();
        let models = ModelManager::new(project.clone(), Arc::clone(&store));
        let index_plans = IndexPlanManager::new(project.clone(), Arc::clone(&store));

        let dataflows = CachedCrud::new(project.clone(), Arc::clone(&store)).with_init_hook(
            Arc::new(DataflowInitHook {
                models: models.crud().clone(),
                index_plans: index_plans.crud().clone(),
            }),
        );
        let segments = CachedCrud::new(project.clone(), Arc::clone(&store)).with_init_hook(
            Arc::new(SegmentInitHook {
                dataflows: dataflows.clone(),
                force_dict_rebuild: config.force_rebuild_dictionaries,
            }),
        );

        Self {
            details: SegmentDetailsManager::new(project.clone(), Arc::clone(&store)),
            fragments: LayoutFragmentManager::new(project.clone(), store),
            txn: TransactionScope::new(config.retry_policy()),
            project,
            config,
            dataflows,
            segments,
            models,
            index_plans,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn config(&self) -> &RealizationConfig {
        &self.config
    }

    pub fn models(&self) -> &ModelManager {
        &self.models
    }

    pub fn index_plans(&self) -> &IndexPlanManager {
        &self.index_plans
    }

    pub fn segment_details(&self) -> &SegmentDetailsManager {
        &self.details
    }

    pub fn layout_fragments(&self) -> &LayoutFragmentManager {
        &self.fragments
    }

    /// Returns a private, mutable copy of a shared dataflow.
    pub fn copy_for_write(&self, dataflow: &Dataflow) -> Dataflow {
        self.dataflows.copy_for_write(dataflow)
    }

    /// Returns a private, mutable copy of a shared segment.
    pub fn copy_segment_for_write(&self, segment: &Segment) -> Segment {
        self.segments.copy_for_write(segment)
    }

    /// Returns the dataflow, BROKEN ones included.
    ///
    /// The model and index plan are resolved on every call, so a dataflow whose dependencies
    /// were deleted after it was cached is reported BROKEN.
    pub async fn get_dataflow(&self, id: ModelId) -> Result<Option<Arc<Dataflow>>> {
        match self.dataflows.get(&id.to_string()).await? {
            Some(dataflow) => Ok(Some(self.check_dependencies(dataflow).await?)),
            None => Ok(None),
        }
    }

    /// Returns every dataflow of the project. BROKEN dataflows are excluded unless
    /// `include_broken` is set.
    pub async fn list_all(&self, include_broken: bool) -> Result<Vec<Arc<Dataflow>>> {
        let mut listed = Vec::new();
        for dataflow in self.dataflows.list_all(true).await? {
            let dataflow = self.check_dependencies(dataflow).await?;
            if include_broken || !dataflow.is_broken() {
                listed.push(dataflow);
            }
        }
        Ok(listed)
    }

    /// Returns `dataflow` unchanged if its model and index plan resolve, a BROKEN copy otherwise.
    async fn check_dependencies(&self, dataflow: Arc<Dataflow>) -> Result<Arc<Dataflow>> {
        if dataflow.is_broken() {
            return Ok(dataflow);
        }
        let id = dataflow.id();
        let model_found = self.models.get(id).await?.is_some();
        let index_plan_found = self.index_plans.get(id).await?.is_some();
        if model_found && index_plan_found {
            return Ok(dataflow);
        }

        tracing::debug!(
            dataflow_id = %id,
            model_found,
            index_plan_found,
            "dataflow dependencies no longer resolve, reporting broken"
        );
        let mut broken = Dataflow::clone(&dataflow);
        broken.envelope_mut().set_broken(true);
        Ok(Arc::new(broken))
    }

    pub async fn get_segment(&self, id: SegmentId) -> Result<Option<Arc<Segment>>> {
        Ok(self.segments.get(&id.to_string()).await?)
    }

    /// Resolves the segments of a dataflow, in range order.
    pub async fn segments(&self, dataflow: &Dataflow) -> Result<Vec<Arc<Segment>>> {
        let mut resolved = Vec::with_capacity(dataflow.segments().len());
        for seg_ref in dataflow.segments() {
            match self.get_segment(seg_ref.id).await? {
                Some(segment) => resolved.push(segment),
                None => {
                    tracing::warn!(
                        dataflow_id = %dataflow.id(),
                        segment_id = %seg_ref.id,
                        "dataflow references a missing segment, skipping"
                    );
                }
            }
        }
        Ok(resolved)
    }

    /// Segments of a dataflow with any of the given statuses, in range order.
    pub async fn segments_by_status(
        &self,
        id: ModelId,
        statuses: &[SegmentStatus],
    ) -> Result<Vec<Arc<Segment>>> {
        let dataflow = self.require_dataflow(id).await?;
        let mut segments = self.segments(&dataflow).await?;
        segments.retain(|s| statuses.contains(&s.status()));
        Ok(segments)
    }

    /// The READY segment with the highest range.
    pub async fn latest_ready_segment(&self, id: ModelId) -> Result<Option<Arc<Segment>>> {
        let ready = self.segments_by_status(id, &[SegmentStatus::Ready]).await?;
        Ok(ready.into_iter().last())
    }

    /// Segments still being built.
    pub async fn building_segments(&self, id: ModelId) -> Result<Vec<Arc<Segment>>> {
        self.segments_by_status(id, &[SegmentStatus::New]).await
    }

    /// Segments that may answer queries.
    pub async fn queryable_segments(&self, id: ModelId) -> Result<Vec<Arc<Segment>>> {
        self.segments_by_status(id, &[SegmentStatus::Ready, SegmentStatus::Warning])
            .await
    }

    pub async fn segment_by_name(&self, id: ModelId, name: &str) -> Result<Option<Arc<Segment>>> {
        let dataflow = self.require_dataflow(id).await?;
        let segments = self.segments(&dataflow).await?;
        Ok(segments.into_iter().find(|s| s.name() == name))
    }

    /// The layout index of a segment.
    pub async fn layout_index(&self, segment: &Segment) -> Result<Arc<LayoutIndex>> {
        segment.layout_index(&self.details).await
    }

    /// Uncovered ranges between the given segments, or between the dataflow's segments if
    /// `segments` is `None`.
    pub async fn calculate_holes(
        &self,
        id: ModelId,
        segments: Option<&[Segment]>,
    ) -> Result<Vec<Segment>> {
        match segments {
            Some(segments) => {
                let refs: Vec<_> = segments.iter().collect();
                Ok(segments::calculate_holes(id, &refs))
            }
            None => self.calculate_seg_holes(id).await,
        }
    }

    /// Uncovered ranges between the dataflow's segments.
    pub async fn calculate_seg_holes(&self, id: ModelId) -> Result<Vec<Segment>> {
        let dataflow = self.require_dataflow(id).await?;
        let segments = self.segments(&dataflow).await?;
        let refs: Vec<_> = segments.iter().map(AsRef::as_ref).collect();
        Ok(segments::calculate_holes(id, &refs))
    }

    /// Uncovered ranges the dataflow would have if a segment over `range` were added.
    pub async fn check_hole_if_new_seg_build(
        &self,
        id: ModelId,
        range: SegmentRange,
    ) -> Result<Vec<Segment>> {
        let dataflow = self.require_dataflow(id).await?;
        let segments = self.segments(&dataflow).await?;
        let prospective = Segment::new(id, SegmentId::new(), range);
        let mut refs: Vec<&Segment> = segments.iter().map(AsRef::as_ref).collect();
        refs.push(&prospective);
        Ok(segments::calculate_holes(id, &refs))
    }

    /// Creates the dataflow bound to the index plan `index_plan_id`.
    #[tracing::instrument(skip_all, fields(dataflow_id = %index_plan_id), err)]
    pub async fn create(
        &self,
        index_plan_id: ModelId,
        owner: &str,
        status: DataflowStatus,
    ) -> Result<Arc<Dataflow>> {
        if status == DataflowStatus::Broken {
            return Err(Error::BrokenStatusNotSettable(index_plan_id));
        }
        if self.models.get(index_plan_id).await?.is_none() {
            return Err(Error::ModelNotFound(index_plan_id));
        }
        if self.index_plans.get(index_plan_id).await?.is_none() {
            return Err(Error::IndexPlanNotFound(index_plan_id));
        }
        if self.get_dataflow(index_plan_id).await?.is_some() {
            return Err(Error::DataflowAlreadyExists(index_plan_id));
        }

        let dataflow = Dataflow::new(index_plan_id, owner, status);
        segments::validate_segments(index_plan_id, &[])?;
        let saved = self.dataflows.save(dataflow).await.map_err(|err| {
            if err.is_version_conflict() {
                Error::DataflowAlreadyExists(index_plan_id)
            } else {
                err.into()
            }
        })?;

        tracing::info!(owner, ?status, "created dataflow");
        Ok(saved)
    }

    /// Sets the status of a dataflow. BROKEN cannot be set.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id), err)]
    pub async fn update_status(&self, id: ModelId, status: DataflowStatus) -> Result<Arc<Dataflow>> {
        if status == DataflowStatus::Broken {
            return Err(Error::BrokenStatusNotSettable(id));
        }
        self.update_dataflow_without_index(DataflowUpdate::new(id).status(status))
            .await
    }

    #[tracing::instrument(skip_all, fields(dataflow_id = %id), err)]
    pub async fn update_cost(&self, id: ModelId, cost: i64) -> Result<Arc<Dataflow>> {
        self.update_dataflow_without_index(DataflowUpdate::new(id).cost(cost))
            .await
    }

    /// Adds query hits to the layout hit counters of a dataflow.
    pub async fn record_layout_hits(
        &self,
        id: ModelId,
        hits: &BTreeMap<LayoutId, u64>,
    ) -> Result<Arc<Dataflow>> {
        self.txn
            .run("record_layout_hits", || async {
                let dataflow = self.writable_dataflow(id).await?;
                let mut copy = self.dataflows.copy_for_write(&dataflow);
                copy.add_layout_hits(hits)?;
                Ok(self.dataflows.save(copy).await?)
            })
            .await
    }

    /// Deletes a dataflow with all its segments, segment details and fragment details.
    ///
    /// BROKEN dataflows can be dropped. Dropping a missing dataflow succeeds.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id), err)]
    pub async fn drop_dataflow(&self, id: ModelId) -> Result<()> {
        self.txn
            .run("drop_dataflow", || async {
                let Some(dataflow) = self.get_dataflow(id).await? else {
                    return Ok(());
                };
                for seg_ref in dataflow.segments() {
                    self.details.delete(seg_ref.id).await?;
                    self.segments.delete_by_key(&seg_ref.id.to_string()).await?;
                }
                self.fragments.drop_dataflow(id).await?;
                self.dataflows.delete(&dataflow).await?;
                Ok::<_, Error>(())
            })
            .await?;

        tracing::info!("dropped dataflow");
        Ok(())
    }

    /// Adds a NEW segment over `range`, optionally registering multi-partition values on it.
    ///
    /// The range must not overlap any existing segment.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id, %range), err)]
    pub async fn append_segment(
        &self,
        id: ModelId,
        range: SegmentRange,
        status: SegmentStatus,
        multi_partition_values: Option<&[Vec<String>]>,
    ) -> Result<Arc<Segment>> {
        let segment_id = SegmentId::new();
        let written = SavedVersions::default();

        let result = self
            .txn
            .run("append_segment", || async {
                let dataflow = self.writable_dataflow(id).await?;
                if let Some(existing) = dataflow.segments().iter().find(|s| s.range.overlaps(&range)) {
                    let existing = self.get_segment(existing.id).await?;
                    return Err(Error::OverlappingSegments {
                        dataflow: id,
                        first: existing
                            .as_ref()
                            .map(|s| s.name().to_string())
                            .unwrap_or_default(),
                        first_range: existing
                            .map(|s| s.range().clone())
                            .unwrap_or_else(|| range.clone()),
                        second: range.segment_name(),
                        second_range: range.clone(),
                    });
                }

                let mut segment = Segment::new(id, segment_id, range.clone());
                segment.set_status(status)?;
                if let Some(values) = multi_partition_values {
                    let model = self.require_model(id).await?;
                    segment.add_partitions(model.resolve_partitions(values)?)?;
                }

                let update = DataflowUpdate::new(id).add_segments([segment]);
                self.apply_update(&update, &written).await?;
                self.require_segment(id, segment_id).await
            })
            .await;
        self.settle(id, &written, result)
            .await
            .inspect(|segment| {
                tracing::info!(segment_id = %segment.id(), name = segment.name(), "appended segment");
            })
    }

    /// Adds a NEW segment replacing the segment that owns exactly `range`. Only the partition
    /// ids of the old segment are carried over, their data is recomputed.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id, %range), err)]
    pub async fn refresh_segment(&self, id: ModelId, range: SegmentRange) -> Result<Arc<Segment>> {
        let segment_id = SegmentId::new();
        let written = SavedVersions::default();

        let result = self
            .txn
            .run("refresh_segment", || async {
                let dataflow = self.writable_dataflow(id).await?;
                let existing = dataflow
                    .segments()
                    .iter()
                    .filter(|s| s.range == range)
                    .find(|s| s.id != segment_id)
                    .ok_or_else(|| Error::NoSegmentForRange {
                        dataflow: id,
                        range: range.clone(),
                    })?;
                let existing = self.require_segment(id, existing.id).await?;

                let mut segment = Segment::new(id, segment_id, range.clone());
                segment.add_partitions(existing.partition_ids())?;

                let update = DataflowUpdate::new(id).add_segments([segment]);
                self.apply_update(&update, &written).await?;
                self.require_segment(id, segment_id).await
            })
            .await;
        self.settle(id, &written, result)
            .await
            .inspect(|segment| {
                tracing::info!(segment_id = %segment.id(), name = segment.name(), "refreshing segment");
            })
    }

    /// Removes segments from a dataflow, e.g. when the job building them is cancelled.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id), err)]
    pub async fn remove_segments(&self, id: ModelId, segment_ids: &[SegmentId]) -> Result<Arc<Dataflow>> {
        self.update_dataflow(DataflowUpdate::new(id).remove_segments(segment_ids.iter().copied()))
            .await
    }

    /// Registers multi-partition values on a segment, as NEW partitions.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id, %segment_id), err)]
    pub async fn append_partitions(
        &self,
        id: ModelId,
        segment_id: SegmentId,
        values: &[Vec<String>],
    ) -> Result<Arc<Segment>> {
        let written = SavedVersions::default();
        self.txn
            .run("append_partitions", || async {
                self.writable_dataflow(id).await?;
                let model = self.require_model(id).await?;
                let partition_ids = model.resolve_partitions(values)?;

                let current = self.require_segment(id, segment_id).await?;
                let mut segment = self.segments.copy_for_write(&current);
                if segment.add_partitions(partition_ids)?.is_empty() {
                    return Ok(current);
                }

                let update = DataflowUpdate::new(id).update_segments([segment]);
                self.apply_update(&update, &written).await?;
                self.require_segment(id, segment_id).await
            })
            .await
    }

    /// Removes layouts from every segment of a dataflow.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id), err)]
    pub async fn remove_layouts(
        &self,
        id: ModelId,
        layout_ids: &BTreeSet<LayoutId>,
    ) -> Result<Arc<Dataflow>> {
        let dataflow = self.writable_dataflow(id).await?;
        let mut removals = Vec::new();
        for segment in self.segments(&dataflow).await? {
            let index = self.layout_index(&segment).await?;
            removals.extend(
                index
                    .all_layouts()
                    .filter(|l| layout_ids.contains(&l.layout_id))
                    .map(|l| l.layout_ref()),
            );
        }
        self.update_dataflow(DataflowUpdate::new(id).remove_layouts(removals))
            .await
    }

    /// Removes partitions from the given segments and from all their layouts.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id), err)]
    pub async fn remove_segment_partition(
        &self,
        id: ModelId,
        partition_ids: &BTreeSet<PartitionId>,
        segment_ids: &BTreeSet<SegmentId>,
    ) -> Result<Arc<Dataflow>> {
        let written = SavedVersions::default();
        self.txn
            .run("remove_segment_partition", || async {
                let dataflow = self.writable_dataflow(id).await?;
                let mut updated = Vec::new();
                for segment in self.segments(&dataflow).await? {
                    if !segment_ids.contains(&segment.id()) {
                        continue;
                    }
                    self.details
                        .remove_partitions(segment.id(), None, partition_ids)
                        .await?;
                    let mut copy = self.segments.copy_for_write(&segment);
                    if copy.remove_partitions(partition_ids)? {
                        updated.push(copy);
                    }
                }
                let update = DataflowUpdate::new(id).update_segments(updated);
                self.apply_update(&update, &written).await
            })
            .await
    }

    /// Removes partitions from the given layouts in every segment of a dataflow.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id), err)]
    pub async fn remove_layout_partition(
        &self,
        id: ModelId,
        partition_ids: &BTreeSet<PartitionId>,
        layout_ids: &BTreeSet<LayoutId>,
    ) -> Result<Arc<Dataflow>> {
        self.txn
            .run("remove_layout_partition", || async {
                let dataflow = self.writable_dataflow(id).await?;
                for seg_ref in dataflow.segments() {
                    self.details
                        .remove_partitions(seg_ref.id, Some(layout_ids), partition_ids)
                        .await?;
                }
                Ok(dataflow)
            })
            .await
    }

    pub(crate) async fn require_dataflow(&self, id: ModelId) -> Result<Arc<Dataflow>> {
        self.get_dataflow(id)
            .await?
            .ok_or(Error::DataflowNotFound(id))
    }

    /// Loads a dataflow for mutation, rejecting BROKEN ones.
    pub(crate) async fn writable_dataflow(&self, id: ModelId) -> Result<Arc<Dataflow>> {
        let dataflow = self.require_dataflow(id).await?;
        if dataflow.is_broken() {
            return Err(Error::DataflowBroken(id));
        }
        Ok(dataflow)
    }

    pub(crate) async fn require_model(&self, id: ModelId) -> Result<Arc<DataModel>> {
        self.models.get(id).await?.ok_or(Error::ModelNotFound(id))
    }

    pub(crate) async fn require_segment(
        &self,
        dataflow: ModelId,
        segment: SegmentId,
    ) -> Result<Arc<Segment>> {
        self.get_segment(segment)
            .await?
            .ok_or(Error::SegmentNotFound { dataflow, segment })
    }
}
