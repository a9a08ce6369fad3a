//! Range checks over the segments of one dataflow: overlap validation and hole detection.

use crate::{
    error::{Error, Result},
    ids::{ModelId, SegmentId},
    segment::{Segment, SegmentStatus},
};

/// Validates the segment ranges of a dataflow.
///
/// All ranges must be of one kind. Two ranges may only overlap if one of them is a NEW segment
/// superseding the other: the NEW segment contains the other range and is either a merge or
/// refresh of finished segments, or a higher merge layer over NEW ones.
pub fn validate_segments(dataflow: ModelId, segments: &[&Segment]) -> Result<()> {
    let mut sorted = segments.to_vec();
    sorted.sort_by(|a, b| a.range().cmp_by_start(b.range()));

    if let Some(first) = sorted.first()
        && let Some(odd) = sorted.iter().find(|s| !s.range().same_kind(first.range()))
    {
        return Err(Error::RangeKindMismatch {
            dataflow,
            range: odd.range().clone(),
            expected: first.range().kind(),
        });
    }

    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            if b.range().start() >= a.range().end() {
                break;
            }
            if !a.range().overlaps(b.range()) || supersedes(a, b) || supersedes(b, a) {
                continue;
            }
            return Err(Error::OverlappingSegments {
                dataflow,
                first: a.name().to_string(),
                first_range: a.range().clone(),
                second: b.name().to_string(),
                second_range: b.range().clone(),
            });
        }
    }
    Ok(())
}

fn supersedes(newer: &Segment, older: &Segment) -> bool {
    if newer.status() != SegmentStatus::New || !newer.range().contains(older.range()) {
        return false;
    }
    older.status() != SegmentStatus::New
        || older.file_layer().unwrap_or(0) < newer.file_layer().unwrap_or(0)
}

/// Returns placeholder segments for every uncovered range between the given segments.
///
/// Touching and overlapping neighbours leave no hole. The result depends only on the input
/// ranges; the placeholders are NEW, unsaved segments of `dataflow`.
pub fn calculate_holes(dataflow: ModelId, segments: &[&Segment]) -> Vec<Segment> {
    let mut sorted = segments.to_vec();
    sorted.sort_by(|a, b| a.range().cmp_by_start(b.range()));

    let mut holes = Vec::new();
    let mut furthest: Option<&Segment> = None;
    for segment in sorted {
        let Some(prev) = furthest else {
            furthest = Some(segment);
            continue;
        };
        if let Some(gap) = prev.range().gap_to(segment.range()) {
            holes.push(Segment::new(dataflow, SegmentId::new(), gap));
        }
        if segment.range().end() > prev.range().end() {
            furthest = Some(segment);
        }
    }
    holes
}
