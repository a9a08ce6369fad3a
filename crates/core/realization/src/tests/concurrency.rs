use std::{collections::BTreeMap, sync::Arc};

use super::fixtures::{day, days, manager, memory_store, segment_ranges, setup_dataflow, time_model};
use crate::{Error, SegmentStatus};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_appends_both_commit() {
    //* Given
    let store = memory_store();
    let first = manager(&store);
    let second = manager(&store);
    let id = setup_dataflow(&first, time_model()).await;

    //* When
    let (a, b) = tokio::join!(
        first.append_segment(id, day(0), SegmentStatus::New, None),
        second.append_segment(id, day(1), SegmentStatus::New, None),
    );

    //* Then
    a.expect("first append should commit");
    b.expect("second append should commit");
    let observer = manager(&store);
    assert_eq!(segment_ranges(&observer, id).await, vec![day(0), day(1)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_appends_admit_one() {
    //* Given
    let store = memory_store();
    let first = manager(&store);
    let second = manager(&store);
    let id = setup_dataflow(&first, time_model()).await;

    //* When
    let (a, b) = tokio::join!(
        first.append_segment(id, days(0, 2), SegmentStatus::New, None),
        second.append_segment(id, days(1, 3), SegmentStatus::New, None),
    );

    //* Then
    let committed = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(committed, 1, "exactly one of two overlapping appends may commit");
    let rejected = a.err().or(b.err()).expect("one append should fail");
    assert!(matches!(rejected, Error::OverlappingSegments { .. }), "got {rejected:?}");
    let observer = manager(&store);
    assert_eq!(segment_ranges(&observer, id).await.len(), 1);
    let stored = observer
        .segments
        .list_all(true)
        .await
        .expect("segments should list");
    assert_eq!(stored.len(), 1, "the rejected append must not leave its segment behind");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_layout_hits_are_not_lost() {
    //* Given
    let store = memory_store();
    let setup = manager(&store);
    let id = setup_dataflow(&setup, time_model()).await;
    let managers: Vec<_> = (0..4).map(|_| Arc::new(manager(&store))).collect();

    //* When
    let handles: Vec<_> = managers
        .iter()
        .map(|manager| {
            let manager = Arc::clone(manager);
            tokio::spawn(async move {
                manager
                    .record_layout_hits(id, &BTreeMap::from([(1, 1)]))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle
            .await
            .expect("task should not panic")
            .expect("hits should be recorded");
    }

    //* Then
    let dataflow = manager(&store)
        .get_dataflow(id)
        .await
        .expect("dataflow should load")
        .expect("dataflow should exist");
    assert_eq!(dataflow.layout_hit_count().get(&1), Some(&4));
}
