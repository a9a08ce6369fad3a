//! Segments: one data range of a dataflow, independently persisted and cached.
//!
//! A segment's layouts live in its [`SegmentDetails`](crate::details::SegmentDetails) record.
//! The [`LayoutIndex`] derived from them is built lazily on first access and kept in a
//! [`OnceCell`]; it records the details version it was built from, so an index that no longer
//! matches the details is rebuilt on access instead of being served stale.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metadata_store::{
    CachedCrud, Entity, EntityInitHook, Envelope, NEW_RESOURCE_MVCC, SharedEntityError,
};
use monitoring::logging;
use tokio::sync::OnceCell;

use crate::{
    dataflow::Dataflow,
    details::SegmentDetailsManager,
    error::Result,
    ids::{BucketId, ModelId, PartitionId, SegmentId},
    layout::LayoutIndex,
    range::SegmentRange,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    New,
    Ready,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionStatus {
    New,
    Ready,
    Refresh,
}

/// A multi-partition entry of a segment.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SegmentPartition {
    pub partition_id: PartitionId,
    pub status: PartitionStatus,
    #[serde(default)]
    pub source_rows: i64,
}

impl SegmentPartition {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            status: PartitionStatus::New,
            source_rows: 0,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Segment {
    id: SegmentId,
    /// Owning dataflow.
    model_id: ModelId,
    name: String,
    status: SegmentStatus,
    range: SegmentRange,
    /// Explicit time coverage of merged segments.
    #[serde(default)]
    ts_range: Option<SegmentRange>,
    create_time: DateTime<Utc>,
    #[serde(default)]
    last_build_time: Option<DateTime<Utc>>,
    #[serde(default)]
    source_rows: i64,
    #[serde(default)]
    source_bytes: i64,
    #[serde(default)]
    column_source_bytes: BTreeMap<String, i64>,
    #[serde(default)]
    snapshot_ready: bool,
    #[serde(default)]
    dict_ready: bool,
    #[serde(default)]
    flat_table_ready: bool,
    #[serde(default)]
    fact_view_ready: bool,
    #[serde(default = "no_bucket")]
    max_bucket_id: BucketId,
    /// Merge layer of segments produced by layered merges.
    #[serde(default)]
    file_layer: Option<u32>,
    #[serde(default)]
    multi_partitions: Vec<SegmentPartition>,

    #[serde(skip)]
    envelope: Envelope,
    #[serde(skip)]
    force_dict_rebuild: bool,
    #[serde(skip)]
    layout_index: OnceCell<Arc<LayoutIndex>>,
}

fn no_bucket() -> BucketId {
    -1
}

impl Segment {
    /// A NEW segment over `range`, named after the range.
    pub fn new(model_id: ModelId, id: SegmentId, range: SegmentRange) -> Self {
        Self {
            id,
            model_id,
            name: range.segment_name(),
            status: SegmentStatus::New,
            range,
            ts_range: None,
            create_time: Utc::now(),
            last_build_time: None,
            source_rows: 0,
            source_bytes: 0,
            column_source_bytes: BTreeMap::new(),
            snapshot_ready: false,
            dict_ready: false,
            flat_table_ready: false,
            fact_view_ready: false,
            max_bucket_id: no_bucket(),
            file_layer: None,
            multi_partitions: Vec::new(),
            envelope: Envelope::default(),
            force_dict_rebuild: false,
            layout_index: OnceCell::new(),
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn model_id(&self) -> ModelId {
        self.model_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> SegmentStatus {
        self.status
    }

    pub fn range(&self) -> &SegmentRange {
        &self.range
    }

    /// Explicit time coverage if set, the range otherwise.
    pub fn ts_range(&self) -> &SegmentRange {
        self.ts_range.as_ref().unwrap_or(&self.range)
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    pub fn last_build_time(&self) -> Option<DateTime<Utc>> {
        self.last_build_time
    }

    pub fn source_rows(&self) -> i64 {
        self.source_rows
    }

    pub fn source_bytes(&self) -> i64 {
        self.source_bytes
    }

    pub fn column_source_bytes(&self) -> &BTreeMap<String, i64> {
        &self.column_source_bytes
    }

    pub fn is_snapshot_ready(&self) -> bool {
        self.snapshot_ready
    }

    /// Always `false` while dictionary rebuilds are forced by configuration.
    pub fn is_dict_ready(&self) -> bool {
        self.dict_ready && !self.force_dict_rebuild
    }

    pub fn is_flat_table_ready(&self) -> bool {
        self.flat_table_ready
    }

    pub fn is_fact_view_ready(&self) -> bool {
        self.fact_view_ready
    }

    pub fn max_bucket_id(&self) -> BucketId {
        self.max_bucket_id
    }

    pub fn file_layer(&self) -> Option<u32> {
        self.file_layer
    }

    pub fn multi_partitions(&self) -> &[SegmentPartition] {
        &self.multi_partitions
    }

    pub fn partition_ids(&self) -> BTreeSet<PartitionId> {
        self.multi_partitions.iter().map(|p| p.partition_id).collect()
    }

    pub fn is_queryable(&self) -> bool {
        matches!(self.status, SegmentStatus::Ready | SegmentStatus::Warning)
    }

    /// Returns the layout index of this segment, building and caching it on first access.
    pub async fn layout_index(&self, details: &SegmentDetailsManager) -> Result<Arc<LayoutIndex>> {
        let current = details.get(self.id).await?;
        let mvcc = current
            .as_ref()
            .map(|d| d.mvcc())
            .unwrap_or(NEW_RESOURCE_MVCC);

        let index = self
            .layout_index
            .get_or_init(|| async { Arc::new(LayoutIndex::build(current.as_deref(), mvcc)) })
            .await;
        if index.details_mvcc() == mvcc {
            return Ok(Arc::clone(index));
        }

        tracing::trace!(segment_id = %self.id, "layout index outdated, rebuilding");
        Ok(Arc::new(LayoutIndex::build(current.as_deref(), mvcc)))
    }

    pub fn set_status(&mut self, status: SegmentStatus) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.status = status;
        Ok(())
    }

    pub(crate) fn set_model_id(&mut self, model_id: ModelId) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.model_id = model_id;
        Ok(())
    }

    pub fn set_ts_range(&mut self, ts_range: SegmentRange) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.ts_range = Some(ts_range);
        Ok(())
    }

    pub fn set_file_layer(&mut self, layer: u32) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.file_layer = Some(layer);
        Ok(())
    }

    pub fn set_last_build_time(&mut self, time: DateTime<Utc>) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.last_build_time = Some(time);
        Ok(())
    }

    pub fn set_source_stats(
        &mut self,
        rows: i64,
        bytes: i64,
        column_bytes: BTreeMap<String, i64>,
    ) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.source_rows = rows;
        self.source_bytes = bytes;
        self.column_source_bytes = column_bytes;
        Ok(())
    }

    pub fn set_snapshot_ready(&mut self, ready: bool) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.snapshot_ready = ready;
        Ok(())
    }

    pub fn set_dict_ready(&mut self, ready: bool) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.dict_ready = ready;
        Ok(())
    }

    pub fn set_flat_table_ready(&mut self, ready: bool) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.flat_table_ready = ready;
        Ok(())
    }

    pub fn set_fact_view_ready(&mut self, ready: bool) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.fact_view_ready = ready;
        Ok(())
    }

    /// Raises the max bucket id, never lowers it.
    pub fn raise_max_bucket_id(&mut self, bucket: BucketId) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        self.max_bucket_id = self.max_bucket_id.max(bucket);
        Ok(())
    }

    /// Adds NEW partition entries for ids the segment does not carry yet. Returns the ids added.
    pub fn add_partitions(
        &mut self,
        ids: impl IntoIterator<Item = PartitionId>,
    ) -> Result<Vec<PartitionId>, SharedEntityError> {
        self.check_writable()?;
        let mut added = Vec::new();
        for id in ids {
            if self.multi_partitions.iter().any(|p| p.partition_id == id) {
                continue;
            }
            self.multi_partitions.push(SegmentPartition::new(id));
            added.push(id);
        }
        self.multi_partitions.sort_by_key(|p| p.partition_id);
        Ok(added)
    }

    /// Replaces the status and source rows of partition entries present in `updates`.
    pub fn update_partitions(
        &mut self,
        updates: &BTreeMap<PartitionId, (PartitionStatus, i64)>,
    ) -> Result<(), SharedEntityError> {
        self.check_writable()?;
        for partition in &mut self.multi_partitions {
            if let Some((status, rows)) = updates.get(&partition.partition_id) {
                partition.status = *status;
                partition.source_rows = *rows;
            }
        }
        Ok(())
    }

    pub fn remove_partitions(
        &mut self,
        ids: &BTreeSet<PartitionId>,
    ) -> Result<bool, SharedEntityError> {
        self.check_writable()?;
        let before = self.multi_partitions.len();
        self.multi_partitions
            .retain(|p| !ids.contains(&p.partition_id));
        Ok(self.multi_partitions.len() != before)
    }
}

impl Entity for Segment {
    const RESOURCE_TYPE: &'static str = "segment";

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
        let id = key.parse().unwrap_or_else(|_| SegmentId::nil());
        Self::new(ModelId::nil(), id, SegmentRange::full_build())
    }

    fn reset_transient(&mut self) {
        self.layout_index = OnceCell::new();
    }
}

/// Resolves a loaded segment against its owning dataflow and applies configuration overrides.
pub(crate) struct SegmentInitHook {
    pub(crate) dataflows: CachedCrud<Dataflow>,
    pub(crate) force_dict_rebuild: bool,
}

#[async_trait]
impl EntityInitHook<Segment> for SegmentInitHook {
    async fn after_load(&self, segment: &mut Segment) {
        segment.force_dict_rebuild = self.force_dict_rebuild;

        let owner = self.dataflows.get(&segment.model_id.to_string()).await;
        match owner {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(
                    segment_id = %segment.id,
                    dataflow_id = %segment.model_id,
                    "segment has no owning dataflow, marking broken"
                );
                segment.envelope.set_broken(true);
            }
            // Unknown: keep the segment usable
            Err(err) => {
                tracing::debug!(
                    segment_id = %segment.id,
                    error = %err,
                    error_source = logging::error_source(&err),
                    "could not resolve owning dataflow of segment"
                );
            }
        }
    }
}
