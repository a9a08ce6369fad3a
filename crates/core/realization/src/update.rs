//! Batch updates: atomic multi-entity mutations of one dataflow.
//!
//! A [`DataflowUpdate`] describes segments to add, replace and remove, layouts to upsert and
//! drop, and optionally a new status and cost. [`DataflowManager::update_dataflow`] applies it
//! as one unit of work, retried from a fresh load on version conflict:
//!
//! 1. load the dataflow and snapshot its segment ids
//! 2. apply segment additions, replacements and removals to a private copy, then validate ranges
//! 3. delete the records of segments that left the dataflow, with their layout fragments
//! 4. save each added or replaced segment on its own
//! 5. drop removed layouts from the layout hit counters
//! 6. set status and cost
//! 7. apply layout deltas to the affected segment details
//! 8. promote added WARNING segments without layouts to READY
//! 9. save the dataflow
//!
//! Deletes are idempotent, and segments saved by a failed attempt are re-saved on top of the
//! version that attempt wrote, so retries never fail on their own earlier side effects.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use metadata_store::Entity;
use monitoring::logging;
use parking_lot::Mutex;

use crate::{
    dataflow::{Dataflow, DataflowStatus, SegmentRef},
    error::{Error, Result},
    ids::{LayoutId, ModelId, SegmentId},
    layout::{Layout, LayoutRef},
    manager::DataflowManager,
    segment::{Segment, SegmentStatus},
    segments,
};

#[derive(Debug, Clone)]
pub struct DataflowUpdate {
    dataflow_id: ModelId,
    pub to_add_segments: Vec<Segment>,
    pub to_update_segments: Vec<Segment>,
    pub to_remove_segments: Vec<SegmentId>,
    pub to_remove_layouts: Vec<LayoutRef>,
    pub to_add_or_update_layouts: Vec<Layout>,
    pub status: Option<DataflowStatus>,
    pub cost: Option<i64>,
}

impl DataflowUpdate {
    pub fn new(dataflow_id: ModelId) -> Self {
        Self {
            dataflow_id,
            to_add_segments: Vec::new(),
            to_update_segments: Vec::new(),
            to_remove_segments: Vec::new(),
            to_remove_layouts: Vec::new(),
            to_add_or_update_layouts: Vec::new(),
            status: None,
            cost: None,
        }
    }

    pub fn dataflow_id(&self) -> ModelId {
        self.dataflow_id
    }

    pub fn add_segments(mut self, segments: impl IntoIterator<Item = Segment>) -> Self {
        self.to_add_segments.extend(segments);
        self
    }

    pub fn update_segments(mut self, segments: impl IntoIterator<Item = Segment>) -> Self {
        self.to_update_segments.extend(segments);
        self
    }

    pub fn remove_segments(mut self, ids: impl IntoIterator<Item = SegmentId>) -> Self {
        self.to_remove_segments.extend(ids);
        self
    }

    pub fn remove_layouts(mut self, layouts: impl IntoIterator<Item = LayoutRef>) -> Self {
        self.to_remove_layouts.extend(layouts);
        self
    }

    pub fn add_or_update_layouts(mut self, layouts: impl IntoIterator<Item = Layout>) -> Self {
        self.to_add_or_update_layouts.extend(layouts);
        self
    }

    pub fn status(mut self, status: DataflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn cost(mut self, cost: i64) -> Self {
        self.cost = Some(cost);
        self
    }

    /// Ids of the layouts removed from any segment.
    pub fn removed_layout_ids(&self) -> BTreeSet<LayoutId> {
        self.to_remove_layouts.iter().map(|l| l.layout_id).collect()
    }

    fn changed_segments(&self) -> impl Iterator<Item = &Segment> {
        self.to_add_segments.iter().chain(&self.to_update_segments)
    }
}

/// Versions of the segments written by earlier attempts of one unit of work.
#[derive(Debug, Default)]
pub(crate) struct SavedVersions(Mutex<HashMap<SegmentId, i64>>);

impl SavedVersions {
    fn get(&self, id: SegmentId) -> Option<i64> {
        self.0.lock().get(&id).copied()
    }

    fn record(&self, id: SegmentId, mvcc: i64) {
        self.0.lock().insert(id, mvcc);
    }

    fn ids(&self) -> Vec<SegmentId> {
        self.0.lock().keys().copied().collect()
    }
}

impl DataflowManager {
    /// Applies a batch update, then prunes removed layouts the index plan scheduled for
    /// deletion once no segment materializes them anymore.
    #[tracing::instrument(skip_all, fields(dataflow_id = %update.dataflow_id()), err)]
    pub async fn update_dataflow(&self, update: DataflowUpdate) -> Result<Arc<Dataflow>> {
        let dataflow = self.run_update(&update).await?;
        self.prune_removed_layouts(&dataflow, &update.removed_layout_ids())
            .await?;
        Ok(dataflow)
    }

    /// Applies a batch update without touching the index plan.
    #[tracing::instrument(skip_all, fields(dataflow_id = %update.dataflow_id()), err)]
    pub async fn update_dataflow_without_index(
        &self,
        update: DataflowUpdate,
    ) -> Result<Arc<Dataflow>> {
        self.run_update(&update).await
    }

    async fn run_update(&self, update: &DataflowUpdate) -> Result<Arc<Dataflow>> {
        let written = SavedVersions::default();
        let dataflow = self
            .txn
            .run("update_dataflow", || self.apply_update(update, &written))
            .await;
        let dataflow = self
            .settle(update.dataflow_id, &written, dataflow)
            .await?;

        tracing::info!(
            added = update.to_add_segments.len(),
            updated = update.to_update_segments.len(),
            removed = update.to_remove_segments.len(),
            layouts_upserted = update.to_add_or_update_layouts.len(),
            layouts_removed = update.to_remove_layouts.len(),
            mvcc = dataflow.mvcc(),
            "applied dataflow update"
        );
        Ok(dataflow)
    }

    /// One attempt at applying `update`. Must run inside the transaction scope.
    pub(crate) async fn apply_update(
        &self,
        update: &DataflowUpdate,
        written: &SavedVersions,
    ) -> Result<Arc<Dataflow>> {
        let id = update.dataflow_id;
        if update.status == Some(DataflowStatus::Broken) {
            return Err(Error::BrokenStatusNotSettable(id));
        }

        // 1
        let current = self.writable_dataflow(id).await?;
        let before = current.segments().to_vec();
        let mut dataflow = self.dataflows.copy_for_write(&current);

        // 2
        for segment in &update.to_add_segments {
            dataflow.add_segment(SegmentRef::from(segment))?;
        }
        for segment in &update.to_update_segments {
            if !dataflow.replace_segment(SegmentRef::from(segment))? {
                return Err(Error::SegmentNotFound {
                    dataflow: id,
                    segment: segment.id(),
                });
            }
        }
        for segment_id in &update.to_remove_segments {
            dataflow.remove_segment(*segment_id)?;
        }
        self.validate_ranges(&dataflow, update).await?;

        // 3
        let remaining = dataflow.segment_ids();
        let removed: Vec<SegmentId> = before
            .iter()
            .map(|s| s.id)
            .filter(|id| !remaining.contains(id))
            .collect();
        self.delete_removed_segments(id, &removed).await?;

        // 4
        for segment in update.changed_segments() {
            self.save_segment(segment.clone(), id, written).await?;
        }

        // 5
        dataflow.remove_layout_hits(&update.removed_layout_ids())?;

        // 6
        if let Some(status) = update.status {
            dataflow.set_status(status)?;
        }
        if let Some(cost) = update.cost {
            dataflow.set_cost(cost)?;
        }

        // 7
        self.apply_layout_deltas(&dataflow, update).await?;

        // 8
        if self.config.auto_promote_empty_warning_segments {
            self.promote_empty_warning_segments(update, written).await?;
        }

        // 9
        Ok(self.dataflows.save(dataflow).await?)
    }

    /// Passes `result` through, discarding the segments of a failed unit of work first.
    pub(crate) async fn settle<T>(&self, id: ModelId, written: &SavedVersions, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.discard_unreferenced(id, written).await;
        }
        result
    }

    /// Deletes segments saved by failed attempts of a unit of work that no dataflow version
    /// references. Best effort: the failure of the unit of work is what the caller reports.
    async fn discard_unreferenced(&self, id: ModelId, written: &SavedVersions) {
        let saved = written.ids();
        if saved.is_empty() {
            return;
        }
        let referenced = match self.get_dataflow(id).await {
            Ok(Some(dataflow)) => dataflow.segment_ids(),
            Ok(None) => BTreeSet::new(),
            Err(err) => {
                tracing::warn!(
                    dataflow_id = %id,
                    error = %err, error_source = logging::error_source(&err),
                    "could not load dataflow, keeping segments of the failed update"
                );
                return;
            }
        };

        for segment_id in saved.into_iter().filter(|s| !referenced.contains(s)) {
            if let Err(err) = self.segments.delete_by_key(&segment_id.to_string()).await {
                tracing::warn!(
                    dataflow_id = %id,
                    %segment_id,
                    error = %err, error_source = logging::error_source(&err),
                    "failed to delete unreferenced segment"
                );
                continue;
            }
            tracing::debug!(dataflow_id = %id, %segment_id, "deleted segment of failed update");
        }
    }

    async fn validate_ranges(&self, dataflow: &Dataflow, update: &DataflowUpdate) -> Result<()> {
        let changed: BTreeMap<SegmentId, &Segment> =
            update.changed_segments().map(|s| (s.id(), s)).collect();

        let mut loaded = Vec::new();
        for seg_ref in dataflow.segments() {
            if changed.contains_key(&seg_ref.id) {
                continue;
            }
            // Records deleted by an earlier attempt are gone for good
            if let Some(segment) = self.get_segment(seg_ref.id).await? {
                loaded.push(segment);
            }
        }

        let mut all: Vec<&Segment> = loaded.iter().map(AsRef::as_ref).collect();
        all.extend(changed.values().copied());
        segments::validate_segments(dataflow.id(), &all)
    }

    async fn delete_removed_segments(&self, id: ModelId, removed: &[SegmentId]) -> Result<()> {
        if removed.is_empty() {
            return Ok(());
        }
        for segment_id in removed {
            self.segments.delete_by_key(&segment_id.to_string()).await?;
            self.details.delete(*segment_id).await?;
            tracing::debug!(dataflow_id = %id, %segment_id, "deleted removed segment");
        }

        let layered = self
            .models
            .get(id)
            .await?
            .is_some_and(|model| model.is_layered());
        if layered {
            self.fragments.remove_segments(id, removed).await?;
        }
        Ok(())
    }

    async fn save_segment(
        &self,
        mut segment: Segment,
        dataflow_id: ModelId,
        written: &SavedVersions,
    ) -> Result<Arc<Segment>> {
        segment.set_model_id(dataflow_id)?;
        if let Some(mvcc) = written.get(segment.id()) {
            segment.rebase(mvcc)?;
        }
        let saved = self.segments.save(segment).await?;
        written.record(saved.id(), saved.mvcc());
        Ok(saved)
    }

    async fn apply_layout_deltas(&self, dataflow: &Dataflow, update: &DataflowUpdate) -> Result<()> {
        let mut upserts: BTreeMap<SegmentId, Vec<Layout>> = BTreeMap::new();
        for layout in &update.to_add_or_update_layouts {
            upserts
                .entry(layout.segment_id)
                .or_default()
                .push(layout.clone());
        }
        let mut removals: BTreeMap<SegmentId, BTreeSet<LayoutId>> = BTreeMap::new();
        for layout in &update.to_remove_layouts {
            removals
                .entry(layout.segment_id)
                .or_default()
                .insert(layout.layout_id);
        }

        let affected: BTreeSet<SegmentId> = upserts.keys().chain(removals.keys()).copied().collect();
        for segment_id in affected {
            if !dataflow.contains_segment(segment_id) {
                tracing::debug!(
                    dataflow_id = %dataflow.id(),
                    %segment_id,
                    "skipping layout changes of a segment outside the dataflow"
                );
                continue;
            }
            self.details
                .apply_layout_delta(
                    dataflow.id(),
                    segment_id,
                    upserts.get(&segment_id).map(Vec::as_slice).unwrap_or_default(),
                    removals.get(&segment_id).unwrap_or(&BTreeSet::new()),
                )
                .await?;
        }
        Ok(())
    }

    async fn promote_empty_warning_segments(
        &self,
        update: &DataflowUpdate,
        written: &SavedVersions,
    ) -> Result<()> {
        for added in &update.to_add_segments {
            if added.status() != SegmentStatus::Warning {
                continue;
            }
            let layouts = self
                .details
                .get(added.id())
                .await?
                .map(|details| details.layouts().len())
                .unwrap_or_default();
            if layouts > 0 {
                continue;
            }

            let Some(current) = self.get_segment(added.id()).await? else {
                continue;
            };
            let mut promoted = self.segments.copy_for_write(&current);
            promoted.set_status(SegmentStatus::Ready)?;
            self.save_segment(promoted, update.dataflow_id, written)
                .await?;
            tracing::debug!(
                dataflow_id = %update.dataflow_id,
                segment_id = %added.id(),
                "promoted WARNING segment without layouts to READY"
            );
        }
        Ok(())
    }

    async fn prune_removed_layouts(
        &self,
        dataflow: &Dataflow,
        removed: &BTreeSet<LayoutId>,
    ) -> Result<()> {
        if removed.is_empty() {
            return Ok(());
        }
        let Some(plan) = self.index_plans.get(dataflow.id()).await? else {
            return Ok(());
        };

        let mut orphaned: BTreeSet<LayoutId> = removed
            .intersection(plan.to_be_deleted())
            .copied()
            .collect();
        for segment in self.segments(dataflow).await? {
            let index = self.layout_index(&segment).await?;
            orphaned.retain(|id| index.layout(*id).is_none());
        }
        if orphaned.is_empty() {
            return Ok(());
        }

        self.txn
            .run("prune_index_plan_layouts", || {
                self.index_plans.remove_layouts(dataflow.id(), &orphaned)
            })
            .await
    }
}
