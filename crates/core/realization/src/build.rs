//! Completion of segment builds, from the per-layout report of the compute layer.

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;

use crate::{
    error::Result,
    fragment::{FragmentCoverage, FragmentRange},
    ids::{BucketId, LayoutId, ModelId, PartitionId, SegmentId},
    layout::{Layout, LayoutPartition},
    manager::DataflowManager,
    segment::{PartitionStatus, Segment, SegmentStatus},
    update::{DataflowUpdate, SavedVersions},
};

/// Output of one layout build.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LayoutBuildStats {
    pub layout_id: LayoutId,
    pub rows: i64,
    pub byte_size: i64,
    pub file_count: i64,
    pub source_rows: i64,
    pub source_byte_size: i64,
    #[serde(default)]
    pub partitions: Vec<PartitionBuildStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartitionBuildStats {
    pub partition_id: PartitionId,
    pub bucket_id: BucketId,
    pub rows: i64,
    pub byte_size: i64,
}

/// What a finished build job reports for one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LayoutBuildReport {
    pub layouts: Vec<LayoutBuildStats>,
    #[serde(default)]
    pub source_rows: i64,
    #[serde(default)]
    pub source_bytes: i64,
    #[serde(default)]
    pub column_source_bytes: BTreeMap<String, i64>,
    /// Source rows per built partition.
    #[serde(default)]
    pub partition_source_rows: BTreeMap<PartitionId, i64>,
}

impl LayoutBuildReport {
    fn layouts_for(&self, segment_id: SegmentId) -> Vec<Layout> {
        let now = Utc::now();
        self.layouts
            .iter()
            .map(|stats| Layout {
                segment_id,
                layout_id: stats.layout_id,
                rows: stats.rows,
                byte_size: stats.byte_size,
                file_count: stats.file_count,
                source_rows: stats.source_rows,
                source_byte_size: stats.source_byte_size,
                ready: true,
                build_time: Some(now),
                multi_partitions: stats
                    .partitions
                    .iter()
                    .map(|p| LayoutPartition {
                        partition_id: p.partition_id,
                        bucket_id: p.bucket_id,
                        rows: p.rows,
                        byte_size: p.byte_size,
                    })
                    .collect(),
            })
            .collect()
    }

    fn max_bucket_id(&self) -> Option<BucketId> {
        self.layouts
            .iter()
            .flat_map(|l| &l.partitions)
            .map(|p| p.bucket_id)
            .max()
    }
}

impl DataflowManager {
    /// Records a finished build of a segment: materializes the reported layouts, marks the
    /// segment READY, and removes the segments it supersedes (the inputs of a merge, or the old
    /// segment of a refresh). Under layered storage the layout fragments are recorded too.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id, %segment_id), err)]
    pub async fn complete_segment_build(
        &self,
        id: ModelId,
        segment_id: SegmentId,
        report: &LayoutBuildReport,
    ) -> Result<Arc<Segment>> {
        let written = SavedVersions::default();

        let segment = self
            .txn
            .run("complete_segment_build", || async {
                let dataflow = self.writable_dataflow(id).await?;
                let current = self.require_segment(id, segment_id).await?;

                let mut segment = self.segments.copy_for_write(&current);
                segment.set_status(SegmentStatus::Ready)?;
                segment.set_last_build_time(Utc::now())?;
                segment.set_source_stats(
                    report.source_rows,
                    report.source_bytes,
                    report.column_source_bytes.clone(),
                )?;
                segment.set_snapshot_ready(true)?;
                segment.set_dict_ready(true)?;
                segment.set_flat_table_ready(true)?;
                segment.set_fact_view_ready(true)?;
                if let Some(bucket) = report.max_bucket_id() {
                    segment.raise_max_bucket_id(bucket)?;
                }
                let partition_updates = report
                    .partition_source_rows
                    .iter()
                    .map(|(partition, rows)| (*partition, (PartitionStatus::Ready, *rows)))
                    .collect();
                segment.update_partitions(&partition_updates)?;

                let superseded: Vec<SegmentId> = dataflow
                    .segments()
                    .iter()
                    .filter(|s| s.id != segment_id && segment.range().contains(&s.range))
                    .map(|s| s.id)
                    .collect();

                let coverage = FragmentRange::from(segment.range());
                let update = DataflowUpdate::new(id)
                    .update_segments([segment])
                    .remove_segments(superseded)
                    .add_or_update_layouts(report.layouts_for(segment_id));
                self.apply_update(&update, &written).await?;

                let model = self.require_model(id).await?;
                if model.is_layered() {
                    for stats in &report.layouts {
                        self.fragments
                            .record(
                                id,
                                stats.layout_id,
                                segment_id,
                                FragmentCoverage {
                                    range: coverage,
                                    file_count: stats.file_count,
                                    byte_size: stats.byte_size,
                                },
                            )
                            .await?;
                    }
                }

                self.require_segment(id, segment_id).await
            })
            .await?;

        tracing::info!(
            name = segment.name(),
            layouts = report.layouts.len(),
            "segment build completed"
        );
        Ok(segment)
    }
}
