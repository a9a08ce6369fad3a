//! Merge planning: validates that segments can be merged and derives the merged segment.

use std::{collections::BTreeSet, sync::Arc};

use crate::{
    error::{Error, Result},
    ids::{ModelId, PartitionId, SegmentId},
    layout::LayoutIndex,
    manager::DataflowManager,
    model::DataModel,
    range::SegmentRange,
    segment::Segment,
    update::{DataflowUpdate, SavedVersions},
};

/// A segment selected for merging, with its layout index.
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub segment: Arc<Segment>,
    pub index: Arc<LayoutIndex>,
}

/// Shape of the segment a merge produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub range: SegmentRange,
    pub ts_range: Option<SegmentRange>,
    pub partitions: BTreeSet<PartitionId>,
}

/// Validates `candidates` (range ordered, at least two) for a merge over `target` and derives the
/// merged segment.
///
/// Layout and partition compatibility are checked regardless of `force`. Gaps between candidates
/// and candidates without rows are only accepted with `force`.
pub fn plan_merge(
    model: &DataModel,
    target: &SegmentRange,
    candidates: &[MergeCandidate],
    force: bool,
    storage_quota: Option<i64>,
) -> Result<MergePlan> {
    let (Some(first), Some(last)) = (candidates.first(), candidates.last()) else {
        return Err(Error::NotEnoughSegmentsToMerge {
            dataflow: model.id(),
            range: target.clone(),
            found: 0,
        });
    };

    let expected_layouts = first.index.effective_layout_ids();
    for candidate in &candidates[1..] {
        let actual = candidate.index.effective_layout_ids();
        if actual != expected_layouts {
            return Err(Error::LayoutMismatch {
                first_segment: first.segment.name().to_string(),
                segment: candidate.segment.name().to_string(),
                expected: expected_layouts.clone(),
                actual: actual.clone(),
            });
        }
    }

    if !force {
        for pair in candidates.windows(2) {
            let (before, after) = (&pair[0].segment, &pair[1].segment);
            if !before.range().connects(after.range()) {
                return Err(Error::SegmentsContainGaps {
                    before: before.name().to_string(),
                    after: after.name().to_string(),
                });
            }
        }

        let empty: Vec<String> = candidates
            .iter()
            .filter(|c| c.index.total_rows() == 0)
            .map(|c| c.segment.name().to_string())
            .collect();
        if !empty.is_empty() {
            return Err(Error::EmptySegments { segments: empty });
        }
    }

    let (range, ts_range) = if first.segment.range().is_time() {
        let range = first.segment.range().span_to(last.segment.range());
        let ts_range = SegmentRange::time(
            first.segment.ts_range().start(),
            last.segment.ts_range().end(),
        );
        (range, Some(ts_range))
    } else {
        (target.clone(), None)
    };

    let partitions = if model.is_multi_partitioned() {
        check_partitions(candidates)?
    } else {
        BTreeSet::new()
    };

    if let Some(quota) = storage_quota {
        let bytes: i64 = candidates.iter().map(|c| c.index.byte_size()).sum();
        if bytes > quota {
            return Err(Error::MergeQuotaExceeded { bytes, quota });
        }
    }

    Ok(MergePlan {
        range,
        ts_range,
        partitions,
    })
}

/// Every candidate, and every effective layout of it, must carry the partitions of the first.
fn check_partitions(candidates: &[MergeCandidate]) -> Result<BTreeSet<PartitionId>> {
    let Some(first) = candidates.first() else {
        return Ok(BTreeSet::new());
    };
    let expected = first.segment.partition_ids();

    for candidate in candidates {
        let actual = candidate.segment.partition_ids();
        if actual != expected {
            return Err(Error::PartitionMismatch {
                segment: candidate.segment.name().to_string(),
                expected,
                actual,
            });
        }
        for layout in candidate.index.effective_layouts() {
            let actual = layout.partition_ids();
            if actual != expected {
                return Err(Error::PartitionMismatch {
                    segment: format!("{} layout {}", candidate.segment.name(), layout.layout_id),
                    expected,
                    actual,
                });
            }
        }
    }
    Ok(expected)
}

impl DataflowManager {
    /// Adds a NEW segment merging the segments within `range`.
    ///
    /// Without `file_layer`, READY and WARNING segments are merged. With a layer `L`, segments of
    /// any status below layer `L` are merged and the merged segment is tagged with layer `L`.
    /// The merged segments stay in place until the merge build completes.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id, %range, force), err)]
    pub async fn merge_segments(
        &self,
        id: ModelId,
        range: SegmentRange,
        force: bool,
        file_layer: Option<u32>,
        new_segment_id: Option<SegmentId>,
    ) -> Result<Arc<Segment>> {
        let segment_id = new_segment_id.unwrap_or_default();
        let written = SavedVersions::default();

        let result = self
            .txn
            .run("merge_segments", || async {
                let dataflow = self.writable_dataflow(id).await?;
                if dataflow.segments().is_empty() {
                    return Err(Error::NoSegments(id));
                }
                let model = self.require_model(id).await?;
                if !model.has_partition_column() {
                    return Err(Error::NoPartitionColumn(id));
                }

                let mut candidates = Vec::new();
                for segment in self.segments(&dataflow).await? {
                    let mergeable = match file_layer {
                        Some(layer) => segment.file_layer().unwrap_or(0) < layer,
                        None => segment.is_queryable(),
                    };
                    if !mergeable || segment.id() == segment_id || !range.contains(segment.range()) {
                        continue;
                    }
                    let index = self.layout_index(&segment).await?;
                    candidates.push(MergeCandidate { segment, index });
                }
                if candidates.len() < 2 {
                    return Err(Error::NotEnoughSegmentsToMerge {
                        dataflow: id,
                        range: range.clone(),
                        found: candidates.len(),
                    });
                }

                let plan = plan_merge(&model, &range, &candidates, force, self.config.merge_quota())?;

                let mut segment = Segment::new(id, segment_id, plan.range);
                if let Some(ts_range) = plan.ts_range {
                    segment.set_ts_range(ts_range)?;
                }
                if let Some(layer) = file_layer {
                    segment.set_file_layer(layer)?;
                }
                segment.add_partitions(plan.partitions)?;

                let update = DataflowUpdate::new(id).add_segments([segment]);
                self.apply_update(&update, &written).await?;
                self.require_segment(id, segment_id).await
            })
            .await;
        let merged = self.settle(id, &written, result).await?;

        tracing::info!(
            segment_id = %merged.id(),
            name = merged.name(),
            "merging segments"
        );
        Ok(merged)
    }
}
