//! Layout instances and the per-segment layout index.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::{
    details::SegmentDetails,
    ids::{BucketId, LayoutId, PartitionId, SegmentId},
};

/// Build output of one layout for one multi-partition value list.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LayoutPartition {
    pub partition_id: PartitionId,
    pub bucket_id: BucketId,
    #[serde(default)]
    pub rows: i64,
    #[serde(default)]
    pub byte_size: i64,
}

/// One materialized layout of one segment, keyed by `(segment_id, layout_id)`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Layout {
    pub segment_id: SegmentId,
    pub layout_id: LayoutId,
    #[serde(default)]
    pub rows: i64,
    #[serde(default)]
    pub byte_size: i64,
    #[serde(default)]
    pub file_count: i64,
    #[serde(default)]
    pub source_rows: i64,
    #[serde(default)]
    pub source_byte_size: i64,
    /// Set once the layout completed a successful build.
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub build_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub multi_partitions: Vec<LayoutPartition>,
}

impl Layout {
    /// A layout registered for a segment but not built yet.
    pub fn placeholder(segment_id: SegmentId, layout_id: LayoutId) -> Self {
        Self {
            segment_id,
            layout_id,
            rows: 0,
            byte_size: 0,
            file_count: 0,
            source_rows: 0,
            source_byte_size: 0,
            ready: false,
            build_time: None,
            multi_partitions: Vec::new(),
        }
    }

    pub fn layout_ref(&self) -> LayoutRef {
        LayoutRef {
            segment_id: self.segment_id,
            layout_id: self.layout_id,
        }
    }

    /// Only layouts built at least once count in aggregate queries.
    pub fn is_effective(&self) -> bool {
        self.ready
    }

    pub fn partition_ids(&self) -> BTreeSet<PartitionId> {
        self.multi_partitions.iter().map(|p| p.partition_id).collect()
    }
}

/// Key of a layout instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayoutRef {
    pub segment_id: SegmentId,
    pub layout_id: LayoutId,
}

/// Read-only view of a segment's layouts, derived from its [`SegmentDetails`].
#[derive(Debug, Clone, Default)]
pub struct LayoutIndex {
    details_mvcc: i64,
    all: BTreeMap<LayoutId, Layout>,
    effective: BTreeSet<LayoutId>,
    partition_buckets: BTreeMap<LayoutId, BTreeMap<PartitionId, BucketId>>,
}

impl LayoutIndex {
    /// Builds the index. `details_mvcc` is the version of `details` (or of their absence) the
    /// index reflects.
    pub(crate) fn build(details: Option<&SegmentDetails>, details_mvcc: i64) -> Self {
        let mut index = LayoutIndex {
            details_mvcc,
            ..Default::default()
        };
        let Some(details) = details else {
            return index;
        };

        for layout in details.layouts() {
            if layout.is_effective() {
                index.effective.insert(layout.layout_id);
            }
            if !layout.multi_partitions.is_empty() {
                let buckets = layout
                    .multi_partitions
                    .iter()
                    .map(|p| (p.partition_id, p.bucket_id))
                    .collect();
                index.partition_buckets.insert(layout.layout_id, buckets);
            }
            index.all.insert(layout.layout_id, layout.clone());
        }
        index
    }

    pub fn details_mvcc(&self) -> i64 {
        self.details_mvcc
    }

    /// Every layout of the segment, including ones that were never built.
    pub fn all_layouts(&self) -> impl Iterator<Item = &Layout> {
        self.all.values()
    }

    pub fn effective_layouts(&self) -> impl Iterator<Item = &Layout> {
        self.effective.iter().filter_map(|id| self.all.get(id))
    }

    pub fn effective_layout_ids(&self) -> &BTreeSet<LayoutId> {
        &self.effective
    }

    pub fn layout(&self, id: LayoutId) -> Option<&Layout> {
        self.all.get(&id)
    }

    pub fn is_effective(&self, id: LayoutId) -> bool {
        self.effective.contains(&id)
    }

    pub fn layout_count(&self) -> usize {
        self.all.len()
    }

    /// Partition to bucket mapping of a multi-partitioned layout.
    pub fn partition_buckets(&self, id: LayoutId) -> Option<&BTreeMap<PartitionId, BucketId>> {
        self.partition_buckets.get(&id)
    }

    /// Rows across effective layouts.
    pub fn total_rows(&self) -> i64 {
        self.effective_layouts().map(|l| l.rows).sum()
    }

    /// On-disk bytes across effective layouts.
    pub fn byte_size(&self) -> i64 {
        self.effective_layouts().map(|l| l.byte_size).sum()
    }
}
