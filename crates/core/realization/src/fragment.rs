//! Layout fragment details of layered storage.
//!
//! Under layered storage the files of a layout are shared by all segments, so the layout's data
//! is tracked per `(dataflow, layout)` rather than per segment: which segments cover it, the
//! disjoint coordinate ranges ("fragments") their data spans, and a table version bumped on
//! every change. The record disappears once no covering segment remains.

use std::{collections::BTreeMap, sync::Arc};

use metadata_store::{CachedCrud, Entity, Envelope, ResourceStore, SharedEntityError};

use crate::{
    error::Result,
    ids::{LayoutId, ModelId, SegmentId},
    range::SegmentRange,
};

/// A closed-open coordinate range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FragmentRange {
    pub start: i64,
    pub end: i64,
}

impl From<&SegmentRange> for FragmentRange {
    fn from(range: &SegmentRange) -> Self {
        Self {
            start: range.start(),
            end: range.end(),
        }
    }
}

/// What one segment contributed to a layout.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FragmentCoverage {
    pub range: FragmentRange,
    pub file_count: i64,
    pub byte_size: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LayoutFragmentDetails {
    model_id: ModelId,
    layout_id: LayoutId,
    /// Disjoint, sorted, derived from `covering_segments`.
    #[serde(default)]
    fragments: Vec<FragmentRange>,
    #[serde(default)]
    covering_segments: BTreeMap<SegmentId, FragmentCoverage>,
    #[serde(default)]
    file_count: i64,
    #[serde(default)]
    byte_size: i64,
    #[serde(default)]
    table_version: u64,
    #[serde(skip)]
    envelope: Envelope,
}

impl LayoutFragmentDetails {
    pub fn new(model_id: ModelId, layout_id: LayoutId) -> Self {
        Self {
            model_id,
            layout_id,
            fragments: Vec::new(),
            covering_segments: BTreeMap::new(),
            file_count: 0,
            byte_size: 0,
            table_version: 0,
            envelope: Envelope::default(),
        }
    }

    pub fn key(model_id: ModelId, layout_id: LayoutId) -> String {
        format!("{model_id}-{layout_id}")
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    pub fn layout_id(&self) -> LayoutId {
        self.layout_id
    }

    pub fn fragments(&self) -> &[FragmentRange] {
        &self.fragments
    }

    pub fn covering_segments(&self) -> &BTreeMap<SegmentId, FragmentCoverage> {
        &self.covering_segments
    }

    pub fn is_covered_by(&self, segment_id: SegmentId) -> bool {
        self.covering_segments.contains_key(&segment_id)
    }

    pub fn file_count(&self) -> i64 {
        self.file_count
    }

    pub fn byte_size(&self) -> i64 {
        self.byte_size
    }

    pub fn table_version(&self) -> u64 {
        self.table_version
    }

    /// Records the data `segment_id` contributed. Re-recording identical coverage is a no-op.
    /// Returns `true` on change.
    pub fn record(
        &mut self,
        segment_id: SegmentId,
        coverage: FragmentCoverage,
    ) -> Result<bool, SharedEntityError> {
        self.check_writable()?;
        if self.covering_segments.get(&segment_id) == Some(&coverage) {
            return Ok(false);
        }
        self.covering_segments.insert(segment_id, coverage);
        self.recompute();
        Ok(true)
    }

    /// Forgets the data of the given segments. Returns `true` on change.
    pub fn remove_segments(&mut self, ids: &[SegmentId]) -> Result<bool, SharedEntityError> {
        self.check_writable()?;
        let before = self.covering_segments.len();
        self.covering_segments.retain(|id, _| !ids.contains(id));
        if self.covering_segments.len() == before {
            return Ok(false);
        }
        self.recompute();
        Ok(true)
    }

    fn recompute(&mut self) {
        self.fragments = merge_fragments(
            self.covering_segments
                .values()
                .map(|coverage| coverage.range)
                .collect(),
        );
        self.file_count = self.covering_segments.values().map(|c| c.file_count).sum();
        self.byte_size = self.covering_segments.values().map(|c| c.byte_size).sum();
        self.table_version += 1;
    }
}

/// Merges overlapping or touching ranges into a sorted disjoint set.
pub fn merge_fragments(mut ranges: Vec<FragmentRange>) -> Vec<FragmentRange> {
    ranges.sort_by_key(|r| r.start);
    let mut index = 1;
    while index < ranges.len() {
        let current = ranges[index - 1];
        let next = ranges[index];
        if next.start <= current.end {
            ranges[index - 1] = FragmentRange {
                start: current.start,
                end: current.end.max(next.end),
            };
            ranges.remove(index);
        } else {
            index += 1;
        }
    }
    ranges
}

impl Entity for LayoutFragmentDetails {
    const RESOURCE_TYPE: &'static str = "layout_fragment";

    fn resource_key(&self) -> String {
        Self::key(self.model_id, self.layout_id)
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn broken_placeholder(_project: &str, key: &str) -> Self {
        // Keys are `{uuid}-{layout}` and uuids contain dashes themselves
        let (model, layout) = key.rsplit_once('-').unwrap_or((key, ""));
        Self::new(
            model.parse().unwrap_or_else(|_| ModelId::nil()),
            layout.parse().unwrap_or(-1),
        )
    }
}

#[derive(Debug, Clone)]
pub struct LayoutFragmentManager {
    crud: CachedCrud<LayoutFragmentDetails>,
}

impl LayoutFragmentManager {
    pub fn new(project: impl Into<String>, store: Arc<dyn ResourceStore>) -> Self {
        Self {
            crud: CachedCrud::new(project, store),
        }
    }

    pub async fn get(
        &self,
        model_id: ModelId,
        layout_id: LayoutId,
    ) -> Result<Option<Arc<LayoutFragmentDetails>>> {
        Ok(self
            .crud
            .get(&LayoutFragmentDetails::key(model_id, layout_id))
            .await?)
    }

    /// Every fragment record of a dataflow, broken ones included.
    pub async fn list_for_dataflow(
        &self,
        model_id: ModelId,
    ) -> Result<Vec<Arc<LayoutFragmentDetails>>> {
        Ok(self
            .crud
            .list(true, |details| details.model_id == model_id)
            .await?)
    }

    /// Records the data a segment contributed to a layout, creating the record on first use.
    pub async fn record(
        &self,
        model_id: ModelId,
        layout_id: LayoutId,
        segment_id: SegmentId,
        coverage: FragmentCoverage,
    ) -> Result<()> {
        let mut details = match self.get(model_id, layout_id).await? {
            Some(current) => self.crud.copy_for_write(&current),
            None => LayoutFragmentDetails::new(model_id, layout_id),
        };
        if details.record(segment_id, coverage)? {
            let saved = self.crud.save(details).await?;
            tracing::debug!(
                dataflow_id = %model_id,
                layout_id,
                %segment_id,
                table_version = saved.table_version(),
                "recorded layout fragment"
            );
        }
        Ok(())
    }

    /// Forgets the data of removed segments in every layout of the dataflow, deleting records
    /// no segment covers anymore. Idempotent.
    pub async fn remove_segments(&self, model_id: ModelId, segment_ids: &[SegmentId]) -> Result<()> {
        if segment_ids.is_empty() {
            return Ok(());
        }
        for current in self.list_for_dataflow(model_id).await? {
            if !segment_ids.iter().any(|id| current.is_covered_by(*id)) {
                continue;
            }
            let mut details = self.crud.copy_for_write(&current);
            details.remove_segments(segment_ids)?;
            if details.covering_segments.is_empty() {
                self.crud.delete(&details).await?;
                tracing::debug!(
                    dataflow_id = %model_id,
                    layout_id = details.layout_id,
                    "removed layout fragment details, no covering segment left"
                );
            } else {
                self.crud.save(details).await?;
            }
        }
        Ok(())
    }

    /// Deletes every fragment record of a dataflow.
    pub async fn drop_dataflow(&self, model_id: ModelId) -> Result<()> {
        for details in self.list_for_dataflow(model_id).await? {
            self.crud.delete(&details).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FragmentCoverage, FragmentRange, LayoutFragmentDetails, merge_fragments};
    use crate::ids::{ModelId, SegmentId};

    fn range(start: i64, end: i64) -> FragmentRange {
        FragmentRange { start, end }
    }

    fn coverage(start: i64, end: i64) -> FragmentCoverage {
        FragmentCoverage {
            range: range(start, end),
            file_count: 1,
            byte_size: 100,
        }
    }

    #[test]
    fn merge_fragments_joins_touching_and_overlapping_ranges() {
        let merged = merge_fragments(vec![range(20, 30), range(0, 10), range(10, 15), range(25, 40)]);
        assert_eq!(merged, vec![range(0, 15), range(20, 40)]);
    }

    #[test]
    fn removing_segments_shrinks_fragments_and_counts() {
        let mut details = LayoutFragmentDetails::new(ModelId::new(), 1);
        let (a, b, c) = (SegmentId::new(), SegmentId::new(), SegmentId::new());
        for (id, cov) in [(a, coverage(0, 10)), (b, coverage(10, 20)), (c, coverage(30, 40))] {
            details.record(id, cov).expect("private details are writable");
        }
        assert_eq!(details.fragments(), &[range(0, 20), range(30, 40)]);
        let version = details.table_version();

        let changed = details.remove_segments(&[b]).expect("private details are writable");

        assert!(changed);
        assert_eq!(details.fragments(), &[range(0, 10), range(30, 40)]);
        assert_eq!(details.file_count(), 2);
        assert_eq!(details.byte_size(), 200);
        assert!(details.table_version() > version, "table version should be bumped");
    }

    #[test]
    fn re_recording_identical_coverage_is_a_noop() {
        let mut details = LayoutFragmentDetails::new(ModelId::new(), 1);
        let id = SegmentId::new();
        details.record(id, coverage(0, 10)).expect("private details are writable");
        let version = details.table_version();

        let changed = details.record(id, coverage(0, 10)).expect("private details are writable");

        assert!(!changed);
        assert_eq!(details.table_version(), version);
    }
}
