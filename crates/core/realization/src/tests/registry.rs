use std::collections::{BTreeMap, BTreeSet};

use metadata_store::Entity;

use super::fixtures::{
    DAY, LAYOUTS, PROJECT, built_segment, day, days, manager, memory_store, report, segment_ranges,
    setup_dataflow, time_model,
};
use crate::{
    DataflowStatus, Error, ErrorKind, ModelId, RetentionRange, SegmentRange, SegmentStatus,
    TimeUnit,
};

#[tokio::test]
async fn create_requires_model_and_index_plan() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = ModelId::new();

    //* When
    let result = manager.create(id, "admin", DataflowStatus::Online).await;

    //* Then
    assert!(
        matches!(result, Err(Error::ModelNotFound(missing)) if missing == id),
        "creating a dataflow without model should fail, got {result:?}"
    );
}

#[tokio::test]
async fn create_rejects_existing_dataflow_and_broken_status() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;

    //* When
    let again = manager.create(id, "admin", DataflowStatus::Online).await;
    let broken = manager.update_status(id, DataflowStatus::Broken).await;

    //* Then
    assert!(matches!(again, Err(Error::DataflowAlreadyExists(_))));
    assert!(matches!(broken, Err(Error::BrokenStatusNotSettable(_))));
    let dataflow = manager
        .get_dataflow(id)
        .await
        .expect("dataflow should load")
        .expect("dataflow should exist");
    assert_eq!(dataflow.status(), DataflowStatus::Online);
    assert_eq!(dataflow.mvcc(), 0, "rejected updates must not write");
}

#[tokio::test]
async fn appended_segments_are_kept_in_range_order() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;

    //* When
    for index in [2, 0, 1] {
        manager
            .append_segment(id, day(index), SegmentStatus::New, None)
            .await
            .expect("disjoint segment should be appended");
    }

    //* Then
    assert_eq!(segment_ranges(&manager, id).await, vec![day(0), day(1), day(2)]);
    let building = manager
        .building_segments(id)
        .await
        .expect("segments should load");
    assert_eq!(building.len(), 3);
    assert_eq!(building[0].name(), "19700101000000_19700102000000");
}

#[tokio::test]
async fn overlapping_append_is_rejected() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;
    manager
        .append_segment(id, days(0, 2), SegmentStatus::New, None)
        .await
        .expect("first segment should be appended");

    //* When
    let result = manager
        .append_segment(id, days(1, 3), SegmentStatus::New, None)
        .await;

    //* Then
    let err = result.expect_err("overlapping segment should be rejected");
    assert!(matches!(err, Error::OverlappingSegments { .. }), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(segment_ranges(&manager, id).await, vec![days(0, 2)]);
}

#[tokio::test]
async fn holes_are_reported_between_segments() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;
    for index in [0, 2] {
        manager
            .append_segment(id, day(index), SegmentStatus::New, None)
            .await
            .expect("segment should be appended");
    }

    //* When
    let holes = manager
        .calculate_seg_holes(id)
        .await
        .expect("holes should be calculated");
    let after_fill = manager
        .check_hole_if_new_seg_build(id, day(1))
        .await
        .expect("prospective holes should be calculated");

    //* Then
    let hole_ranges: Vec<_> = holes.iter().map(|h| h.range().clone()).collect();
    assert_eq!(hole_ranges, vec![day(1)]);
    assert!(after_fill.is_empty(), "filling the gap should leave no hole");
}

#[tokio::test]
async fn refreshed_segment_replaces_old_one_once_built() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;
    let old = built_segment(&manager, id, day(0), &report(&LAYOUTS, 100)).await;

    //* When
    let refreshed = manager
        .refresh_segment(id, day(0))
        .await
        .expect("refresh should be accepted");
    let during = segment_ranges(&manager, id).await;
    manager
        .complete_segment_build(id, refreshed.id(), &report(&LAYOUTS, 120))
        .await
        .expect("refresh build should complete");

    //* Then
    assert_eq!(refreshed.status(), SegmentStatus::New);
    assert_eq!(during, vec![day(0), day(0)], "old segment serves queries during refresh");
    let dataflow = manager
        .get_dataflow(id)
        .await
        .expect("dataflow should load")
        .expect("dataflow should exist");
    assert_eq!(dataflow.segment_ids(), BTreeSet::from([refreshed.id()]));
    assert!(
        manager
            .segment_details()
            .get(old.id())
            .await
            .expect("details should load")
            .is_none(),
        "details of the replaced segment should be deleted"
    );
}

#[tokio::test]
async fn refresh_requires_a_segment_with_the_exact_range() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;
    built_segment(&manager, id, days(0, 2), &report(&LAYOUTS, 10)).await;

    //* When
    let result = manager.refresh_segment(id, day(0)).await;

    //* Then
    assert!(matches!(result, Err(Error::NoSegmentForRange { .. })), "got {result:?}");
}

#[tokio::test]
async fn warning_segment_without_layouts_is_promoted() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;

    //* When
    let segment = manager
        .append_segment(id, day(0), SegmentStatus::Warning, None)
        .await
        .expect("segment should be appended");

    //* Then
    assert_eq!(segment.status(), SegmentStatus::Ready);
}

#[tokio::test]
async fn cached_segment_cannot_be_mutated_in_place() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;
    let cached = manager
        .append_segment(id, day(0), SegmentStatus::New, None)
        .await
        .expect("segment should be appended");

    //* When
    let mut shared = (*cached).clone();
    let in_place = shared.set_status(SegmentStatus::Ready);
    let mut private = manager.copy_segment_for_write(&cached);
    let on_copy = private.set_status(SegmentStatus::Ready);

    //* Then
    assert!(in_place.is_err(), "clones of cached instances stay shared");
    assert!(on_copy.is_ok(), "private copies are writable");
    assert_eq!(cached.status(), SegmentStatus::New);
}

#[tokio::test]
async fn stale_writer_fails_with_version_conflict() {
    //* Given
    let store = memory_store();
    let writer = manager(&store);
    let stale_writer = manager(&store);
    let id = setup_dataflow(&writer, time_model()).await;
    let stale = stale_writer
        .get_dataflow(id)
        .await
        .expect("dataflow should load")
        .expect("dataflow should exist");
    writer
        .update_cost(id, 10)
        .await
        .expect("cost update should succeed");

    //* When
    let mut copy = stale_writer.copy_for_write(&stale);
    copy.set_cost(20).expect("copy should be writable");
    let result = stale_writer.dataflows.save(copy).await;

    //* Then
    let err = result.expect_err("saving over a newer version should fail");
    assert!(err.is_version_conflict(), "got {err:?}");
    let reloaded = stale_writer
        .get_dataflow(id)
        .await
        .expect("dataflow should load")
        .expect("dataflow should exist");
    assert_eq!(reloaded.cost(), 10, "the failed writer sees the winning version");
}

#[tokio::test]
async fn dataflow_without_index_plan_is_broken() {
    //* Given
    let store = memory_store();
    let setup = manager(&store);
    let id = setup_dataflow(&setup, time_model()).await;
    setup
        .index_plans()
        .delete(id)
        .await
        .expect("index plan should be deleted");
    let manager = manager(&store);

    //* When
    let dataflow = manager
        .get_dataflow(id)
        .await
        .expect("dataflow should load")
        .expect("broken dataflow is still returned by id");
    let listed = manager.list_all(false).await.expect("list should succeed");
    let listed_broken = manager.list_all(true).await.expect("list should succeed");
    let append = manager
        .append_segment(id, day(0), SegmentStatus::New, None)
        .await;

    //* Then
    assert_eq!(dataflow.status(), DataflowStatus::Broken);
    assert!(listed.is_empty(), "broken dataflows are excluded by default");
    assert_eq!(listed_broken.len(), 1);
    let err = append.expect_err("broken dataflows reject writes");
    assert_eq!(err.kind(), ErrorKind::Degraded);
    manager
        .drop_dataflow(id)
        .await
        .expect("broken dataflows can be dropped");
}

#[tokio::test]
async fn cached_dataflow_turns_broken_when_dependencies_are_deleted() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;
    let warmed = manager.list_all(false).await.expect("list should succeed");
    assert_eq!(warmed.len(), 1, "the healthy dataflow is listed and cached");

    //* When
    manager
        .index_plans()
        .delete(id)
        .await
        .expect("index plan should be deleted");
    manager
        .models()
        .delete(id)
        .await
        .expect("model should be deleted");

    //* Then
    let listed = manager.list_all(false).await.expect("list should succeed");
    assert!(listed.is_empty(), "dataflows with deleted dependencies are excluded");
    let dataflow = manager
        .get_dataflow(id)
        .await
        .expect("dataflow should load")
        .expect("broken dataflow is still returned by id");
    assert_eq!(dataflow.status(), DataflowStatus::Broken);
    let err = manager
        .append_segment(id, day(0), SegmentStatus::New, None)
        .await
        .expect_err("broken dataflows reject writes");
    assert!(matches!(err, Error::DataflowBroken(broken) if broken == id), "got {err:?}");
}

#[tokio::test]
async fn drop_removes_dataflow_and_segments() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;
    let segment = built_segment(&manager, id, day(0), &report(&LAYOUTS, 10)).await;

    //* When
    manager.drop_dataflow(id).await.expect("drop should succeed");
    let again = manager.drop_dataflow(id).await;

    //* Then
    assert!(again.is_ok(), "dropping a missing dataflow succeeds");
    assert!(manager.get_dataflow(id).await.expect("load").is_none());
    assert!(manager.get_segment(segment.id()).await.expect("load").is_none());
    assert!(
        manager
            .segment_details()
            .get(segment.id())
            .await
            .expect("load")
            .is_none()
    );
    assert!(store.list_keys(PROJECT, "segment").await.expect("list").is_empty());
}

#[tokio::test]
async fn multi_partition_values_are_tracked_per_segment() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let model = time_model().with_multi_partition(vec!["region".to_string()]);
    let id = setup_dataflow(&manager, model).await;
    let values = |v: &str| vec![v.to_string()];
    let partition_ids = manager
        .models()
        .add_partition_values(id, &[values("us"), values("eu")])
        .await
        .expect("partition values should be registered");
    let (us, eu) = (partition_ids[0], partition_ids[1]);

    //* When
    let segment = manager
        .append_segment(id, day(0), SegmentStatus::New, Some([values("us")].as_slice()))
        .await
        .expect("segment should be appended");
    let extended = manager
        .append_partitions(id, segment.id(), &[values("eu")])
        .await
        .expect("partition should be appended");
    let unknown = manager
        .append_partitions(id, segment.id(), &[values("apac")])
        .await;
    manager
        .remove_segment_partition(id, &BTreeSet::from([us]), &BTreeSet::from([segment.id()]))
        .await
        .expect("partition should be removed");

    //* Then
    assert_eq!(segment.partition_ids(), BTreeSet::from([us]));
    assert_eq!(extended.partition_ids(), BTreeSet::from([us, eu]));
    assert!(matches!(unknown, Err(Error::UnknownPartitionValues { .. })), "got {unknown:?}");
    let current = manager
        .get_segment(segment.id())
        .await
        .expect("segment should load")
        .expect("segment should exist");
    assert_eq!(current.partition_ids(), BTreeSet::from([eu]));
}

#[tokio::test]
async fn removed_layouts_are_pruned_from_index_plan() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;
    let segment = built_segment(&manager, id, day(0), &report(&LAYOUTS, 10)).await;
    manager
        .record_layout_hits(id, &BTreeMap::from([(1, 3), (2, 5)]))
        .await
        .expect("hits should be recorded");
    let plan = manager
        .index_plans()
        .get(id)
        .await
        .expect("plan should load")
        .expect("plan should exist");
    let mut plan = manager.index_plans().copy_for_write(&plan);
    plan.mark_to_be_deleted([2]).expect("copy should be writable");
    manager.index_plans().save(plan).await.expect("plan should be saved");

    //* When
    let dataflow = manager
        .remove_layouts(id, &BTreeSet::from([2]))
        .await
        .expect("layouts should be removed");

    //* Then
    assert_eq!(dataflow.layout_hit_count(), &BTreeMap::from([(1, 3)]));
    let index = manager
        .layout_index(&segment)
        .await
        .expect("layout index should load");
    assert_eq!(index.effective_layout_ids(), &BTreeSet::from([1]));
    let plan = manager
        .index_plans()
        .get(id)
        .await
        .expect("plan should load")
        .expect("plan should exist");
    assert_eq!(plan.layouts(), &BTreeSet::from([1]));
    assert!(plan.to_be_deleted().is_empty());
}

#[tokio::test]
async fn retention_removes_expired_segments() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;
    let mut segments = Vec::new();
    for index in 0..10 {
        segments.push(built_segment(&manager, id, day(index), &report(&LAYOUTS, 10)).await);
    }

    //* When
    let removed = manager
        .apply_retention(id, RetentionRange::new(TimeUnit::Day, 7))
        .await
        .expect("retention should apply");

    //* Then
    let expected: Vec<_> = segments[..3].iter().map(|s| s.id()).collect();
    assert_eq!(removed, expected);
    let ranges = segment_ranges(&manager, id).await;
    assert_eq!(ranges.first(), Some(&day(3)));
    assert_eq!(ranges.len(), 7);
}

#[tokio::test]
async fn auto_merge_range_covers_first_closed_week() {
    //* Given
    let store = memory_store();
    let manager = manager(&store);
    let id = setup_dataflow(&manager, time_model()).await;
    for index in 0..9 {
        built_segment(&manager, id, day(index), &report(&LAYOUTS, 10)).await;
    }

    //* When
    let range = manager
        .auto_merge_range(id, &[TimeUnit::Day, TimeUnit::Week])
        .await
        .expect("auto merge range should be computed");

    //* Then
    // 1970-01-01 was a Thursday, its week ends on Monday 1970-01-05
    assert_eq!(range, Some(SegmentRange::time(0, 4 * DAY)));
}
