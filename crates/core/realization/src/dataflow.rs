//! The dataflow: aggregate root of one realized model.
//!
//! A dataflow owns the ordered list of its segments' identities, not the segments themselves:
//! segments are persisted and versioned independently, so that writes to different segments of
//! one dataflow never contend. Each [`SegmentRef`] carries the segment range, which keeps the list
//! ordered and lets removals clean up range-keyed records without loading the segment.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metadata_store::{CachedCrud, Entity, EntityInitHook, Envelope, SharedEntityError};

use crate::{
    ids::{LayoutId, ModelId, SegmentId},
    model::{DataModel, IndexPlan},
    range::SegmentRange,
    segment::Segment,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataflowStatus {
    New,
    Online,
    Offline,
    Warning,
    Broken,
}

/// Identity and range of a segment within its dataflow.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SegmentRef {
    pub id: SegmentId,
    pub range: SegmentRange,
}

impl From<&Segment> for SegmentRef {
    fn from(segment: &Segment) -> Self {
        Self {
            id: segment.id(),
            range: segment.range().clone(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Dataflow {
    /// Shared with the model and the index plan.
    id: ModelId,
    owner: String,
    create_time: DateTime<Utc>,
    status: DataflowStatus,
    #[serde(default)]
    cost: i64,
    #[serde(default)]
    layout_hit_count: BTreeMap<LayoutId, u64>,
    /// Sorted by range start.
    #[serde(default)]
    segments: Vec<SegmentRef>,
    #[serde(skip)]
    envelope: Envelope,
}

impl Dataflow {
    pub fn new(id: ModelId, owner: impl Into<String>, status: DataflowStatus) -> Self {
        Self {
            id,
            owner: owner.into(),
            create_time: Utc::now(),
            status,
            cost: 0,
            layout_hit_count: BTreeMap::new(),
            segments: Vec::new(),
            envelope: Envelope::default(),
        }
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    /// BROKEN if the dataflow's dependencies are unreadable, the stored status otherwise.
    pub fn status(&self) -> DataflowStatus {
        if self.is_broken() {
            DataflowStatus::Broken
        } else {
            self.status
        }
    }

    pub fn cost(&self) -> i64 {
        self.cost
    }

    pub fn layout_hit_count(&self) -> &BTreeMap<LayoutId, u64> {
        &self.layout_hit_count
    }

    pub fn segments(&self) -> &[SegmentRef] {
        &self.segments
    }

    pub fn segment_ids(&self) -> BTreeSet<SegmentId> {
        self.segments.iter().map(|s| s.id).collect()
    }

    pub fn contains_segment(&self, id: SegmentId) -> bool {
        self.segments.iter().any(|s| s.id == id)
    }

    pub fn add_segment(&mut self, segment: SegmentRef) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.segments.retain(|s| s.id != segment.id);
        let idx = self
            .segments
            .partition_point(|s| s.range.cmp_by_start(&segment.range).is_le());
        self.segments.insert(idx, segment);
        Ok(())
    }

    /// Replaces the entry with the same id in place. Returns `false` if there is none.
    pub fn replace_segment(&mut self, segment: SegmentRef) -> Result<bool, SharedEntityError> {
        self.check_writable()?;
        let Some(existing) = self.segments.iter_mut().find(|s| s.id == segment.id) else {
            return Ok(false);
        };
        *existing = segment;
        self.segments.sort_by(|a, b| a.range.cmp_by_start(&b.range));
        Ok(true)
    }

    /// Removes the entry with the given id. Returns `false` if there is none.
    pub fn remove_segment(&mut self, id: SegmentId) -> Result<bool, SharedEntityError> {
        self.check_writable()?;
        let before = self.segments.len();
        self.segments.retain(|s| s.id != id);
        Ok(self.segments.len() != before)
    }

    pub fn set_status(&mut self, status: DataflowStatus) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.status = status;
        Ok(())
    }

    pub fn set_cost(&mut self, cost: i64) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.cost = cost;
        Ok(())
    }

    pub fn add_layout_hits(
        &mut self,
        hits: &BTreeMap<LayoutId, u64>,
    ) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        for (layout, count) in hits {
            *self.layout_hit_count.entry(*layout).or_default() += count;
        }
        Ok(())
    }

    pub fn remove_layout_hits(
        &mut self,
        layouts: &BTreeSet<LayoutId>,
    ) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.layout_hit_count
            .retain(|layout, _| !layouts.contains(layout));
        Ok(())
    }
}

impl Entity for Dataflow {
    const RESOURCE_TYPE: &'static str = "dataflow";

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
        let id = key.parse().unwrap_or_else(|_| ModelId::nil());
        Self::new(id, "", DataflowStatus::Broken)
    }
}

/// Marks a dataflow BROKEN when its model or index plan cannot be resolved.
pub(crate) struct DataflowInitHook {
    pub(crate) models: CachedCrud<DataModel>,
    pub(crate) index_plans: CachedCrud<IndexPlan>,
}

#[async_trait]
impl EntityInitHook<Dataflow> for DataflowInitHook {
    async fn after_load(&self, dataflow: &mut Dataflow) {
        let key = dataflow.id.to_string();
        let model = self.models.get(&key).await;
        let plan = self.index_plans.get(&key).await;

        let healthy = matches!(&model, Ok(Some(model)) if !model.is_broken())
            && matches!(&plan, Ok(Some(plan)) if !plan.is_broken());
        if !healthy {
            tracing::warn!(
                dataflow_id = %dataflow.id,
                model_found = matches!(model, Ok(Some(_))),
                index_plan_found = matches!(plan, Ok(Some(_))),
                "dataflow dependencies unreadable, marking broken"
            );
            dataflow.envelope.set_broken(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Dataflow, DataflowStatus, SegmentRef};
    use crate::{
        ids::{ModelId, SegmentId},
        range::SegmentRange,
    };

    fn seg_ref(start: i64, end: i64) -> SegmentRef {
        SegmentRef {
            id: SegmentId::new(),
            range: SegmentRange::time(start, end),
        }
    }

    #[test]
    fn segments_stay_sorted_by_range() {
        let mut dataflow = Dataflow::new(ModelId::new(), "admin", DataflowStatus::Offline);

        for (start, end) in [(20, 30), (0, 10), (10, 20)] {
            dataflow
                .add_segment(seg_ref(start, end))
                .expect("private dataflow is writable");
        }

        let starts: Vec<_> = dataflow.segments().iter().map(|s| s.range.start()).collect();
        assert_eq!(starts, vec![0, 10, 20]);
    }

    #[test]
    fn layout_hits_accumulate_and_can_be_removed() {
        let mut dataflow = Dataflow::new(ModelId::new(), "admin", DataflowStatus::Online);

        dataflow
            .add_layout_hits(&BTreeMap::from([(1, 2), (2, 1)]))
            .expect("private dataflow is writable");
        dataflow
            .add_layout_hits(&BTreeMap::from([(1, 3)]))
            .expect("private dataflow is writable");
        dataflow
            .remove_layout_hits(&[2].into())
            .expect("private dataflow is writable");

        assert_eq!(dataflow.layout_hit_count(), &BTreeMap::from([(1, 5)]));
    }
}
