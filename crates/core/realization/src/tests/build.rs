use std::{collections::BTreeMap, sync::Arc};

use super::fixtures::{LAYOUTS, PROJECT, day, manager, memory_store, report, setup_dataflow, test_config, time_model};
use crate::{
    DataflowManager, Error, LayoutBuildReport, LayoutBuildStats, PartitionBuildStats,
    PartitionStatus, RealizationConfig, SegmentId, SegmentStatus,
};

#[tokio::test]
async fn completed_build_marks_segment_ready() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let model = time_model().with_multi_partition(vec!["region".to_string()]);
    let id = setup_dataflow(&manager, model).await;
    let us = vec!["us".to_string()];
    let partition = manager
        .models()
        .add_partition_values(id, &[us.clone()])
        .await
        .expect("partition values should be registered")[0];
    let segment = manager
        .append_segment(id, day(0), SegmentStatus::New, Some([us].as_slice()))
        .await
        .expect("segment should be appended");

    let report = LayoutBuildReport {
        layouts: vec![LayoutBuildStats {
            layout_id: 1,
            rows: 40,
            byte_size: 400,
            file_count: 2,
            source_rows: 50,
            source_byte_size: 500,
            partitions: vec![PartitionBuildStats {
                partition_id: partition,
                bucket_id: 3,
                rows: 40,
                byte_size: 400,
            }],
        }],
        source_rows: 50,
        source_bytes: 500,
        column_source_bytes: BTreeMap::from([("amount".to_string(), 200)]),
        partition_source_rows: BTreeMap::from([(partition, 50)]),
    };

    //* When
    let built = manager
        .complete_segment_build(id, segment.id(), &report)
        .await
        .expect("build should complete");

    //* Then
    assert_eq!(built.status(), SegmentStatus::Ready);
    assert!(built.last_build_time().is_some());
    assert_eq!(built.source_rows(), 50);
    assert_eq!(built.column_source_bytes().get("amount"), Some(&200));
    assert!(built.is_dict_ready());
    assert_eq!(built.max_bucket_id(), 3);
    assert_eq!(built.multi_partitions()[0].status, PartitionStatus::Ready);
    assert_eq!(built.multi_partitions()[0].source_rows, 50);

    let index = manager
        .layout_index(&built)
        .await
        .expect("layout index should load");
    assert_eq!(index.total_rows(), 40);
    assert_eq!(
        index.partition_buckets(1),
        Some(&BTreeMap::from([(partition, 3)]))
    );
    let latest = manager
        .latest_ready_segment(id)
        .await
        .expect("segments should load")
        .expect("a READY segment should exist");
    assert_eq!(latest.id(), segment.id());
}

#[tokio::test]
async fn forced_dictionary_rebuild_reports_dictionaries_missing() {
    //* Given
    let store = memory_store();
    let config = RealizationConfig {
        force_rebuild_dictionaries: true,
        ..test_config()
    };
    let manager = DataflowManager::new(PROJECT, Arc::clone(&store), Arc::new(config));
    let id = setup_dataflow(&manager, time_model()).await;
    let segment = manager
        .append_segment(id, day(0), SegmentStatus::New, None)
        .await
        .expect("segment should be appended");
    manager
        .complete_segment_build(id, segment.id(), &report(&LAYOUTS, 10))
        .await
        .expect("build should complete");

    //* When
    let reader = DataflowManager::new(
        PROJECT,
        Arc::clone(&store),
        Arc::new(RealizationConfig {
            force_rebuild_dictionaries: true,
            ..test_config()
        }),
    );
    let loaded = reader
        .get_segment(segment.id())
        .await
        .expect("segment should load")
        .expect("segment should exist");

    //* Then
    assert!(!loaded.is_dict_ready(), "loaded segments must report dictionaries as missing");
    assert!(loaded.is_snapshot_ready());
}

#[tokio::test]
async fn completing_unknown_segment_fails() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;

    //* When
    let result = manager
        .complete_segment_build(id, SegmentId::new(), &report(&LAYOUTS, 10))
        .await;

    //* Then
    assert!(matches!(result, Err(Error::SegmentNotFound { .. })), "got {result:?}");
}
