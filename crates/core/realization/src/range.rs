//! Segment ranges: closed-open intervals over a comparable coordinate.
//!
//! A range is either a time range (epoch milliseconds), a source offset range, or a Kafka
//! offset range that additionally records the per-partition offsets at both ends. Ranges of
//! different kinds are never comparable: they never connect, overlap or contain each other.

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use chrono::DateTime;

/// Kafka partition number.
pub type KafkaPartition = i32;

/// Name given to the segment of a model without partition column.
pub const FULL_BUILD_NAME: &str = "FULL_BUILD";

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SegmentRange {
    /// Epoch milliseconds, `[start, end)`.
    Time { start: i64, end: i64 },
    /// Source offsets, `[start, end)`.
    Offset { start: i64, end: i64 },
    /// Kafka offsets, `[start, end)`, with per-partition offsets at both ends.
    KafkaOffset {
        start: i64,
        end: i64,
        #[serde(default)]
        partition_offset_start: BTreeMap<KafkaPartition, i64>,
        #[serde(default)]
        partition_offset_end: BTreeMap<KafkaPartition, i64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Time,
    Offset,
    KafkaOffset,
}

impl fmt::Display for RangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeKind::Time => f.write_str("time"),
            RangeKind::Offset => f.write_str("offset"),
            RangeKind::KafkaOffset => f.write_str("kafka offset"),
        }
    }
}

impl SegmentRange {
    pub fn time(start: i64, end: i64) -> Self {
        SegmentRange::Time { start, end }
    }

    pub fn offset(start: i64, end: i64) -> Self {
        SegmentRange::Offset { start, end }
    }

    pub fn kafka_offset(
        partition_offset_start: BTreeMap<KafkaPartition, i64>,
        partition_offset_end: BTreeMap<KafkaPartition, i64>,
    ) -> Self {
        SegmentRange::KafkaOffset {
            start: partition_offset_start.values().sum(),
            end: partition_offset_end.values().sum(),
            partition_offset_start,
            partition_offset_end,
        }
    }

    /// The unbounded time range covered by the single segment of a model without partition
    /// column.
    pub fn full_build() -> Self {
        SegmentRange::Time {
            start: 0,
            end: i64::MAX,
        }
    }

    pub fn kind(&self) -> RangeKind {
        match self {
            SegmentRange::Time { .. } => RangeKind::Time,
            SegmentRange::Offset { .. } => RangeKind::Offset,
            SegmentRange::KafkaOffset { .. } => RangeKind::KafkaOffset,
        }
    }

    pub fn start(&self) -> i64 {
        match self {
            SegmentRange::Time { start, .. }
            | SegmentRange::Offset { start, .. }
            | SegmentRange::KafkaOffset { start, .. } => *start,
        }
    }

    pub fn end(&self) -> i64 {
        match self {
            SegmentRange::Time { end, .. }
            | SegmentRange::Offset { end, .. }
            | SegmentRange::KafkaOffset { end, .. } => *end,
        }
    }

    pub fn is_full_build(&self) -> bool {
        matches!(self, SegmentRange::Time { start: 0, end: i64::MAX })
    }

    pub fn is_time(&self) -> bool {
        self.kind() == RangeKind::Time
    }

    pub fn same_kind(&self, other: &Self) -> bool {
        self.kind() == other.kind()
    }

    /// `true` if `other` starts exactly where this range ends.
    pub fn connects(&self, other: &Self) -> bool {
        self.same_kind(other) && self.end() == other.start()
    }

    /// `true` if this range ends strictly before `other` starts, leaving a non-empty gap.
    pub fn apart_before(&self, other: &Self) -> bool {
        self.same_kind(other) && self.end() < other.start()
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.same_kind(other) && self.start() < other.end() && other.start() < self.end()
    }

    pub fn contains(&self, other: &Self) -> bool {
        self.same_kind(other) && self.start() <= other.start() && other.end() <= self.end()
    }

    /// Strict total order on range start, ties broken by range end.
    pub fn cmp_by_start(&self, other: &Self) -> Ordering {
        self.start()
            .cmp(&other.start())
            .then_with(|| self.end().cmp(&other.end()))
    }

    /// The range from the start of `self` to the end of `last`.
    ///
    /// Kafka ranges keep the per-partition start offsets of `self` and end offsets of `last`.
    pub fn span_to(&self, last: &Self) -> Self {
        match (self, last) {
            (
                SegmentRange::KafkaOffset {
                    start,
                    partition_offset_start,
                    ..
                },
                SegmentRange::KafkaOffset {
                    end,
                    partition_offset_end,
                    ..
                },
            ) => SegmentRange::KafkaOffset {
                start: *start,
                end: *end,
                partition_offset_start: partition_offset_start.clone(),
                partition_offset_end: partition_offset_end.clone(),
            },
            _ => self.with_bounds(self.start(), last.end()),
        }
    }

    /// The uncovered range between `self` and a later range `next`, if they are apart.
    pub fn gap_to(&self, next: &Self) -> Option<Self> {
        if !self.apart_before(next) {
            return None;
        }
        match (self, next) {
            (
                SegmentRange::KafkaOffset {
                    end,
                    partition_offset_end,
                    ..
                },
                SegmentRange::KafkaOffset {
                    start,
                    partition_offset_start,
                    ..
                },
            ) => Some(SegmentRange::KafkaOffset {
                start: *end,
                end: *start,
                partition_offset_start: partition_offset_end.clone(),
                partition_offset_end: partition_offset_start.clone(),
            }),
            _ => Some(self.with_bounds(self.end(), next.start())),
        }
    }

    /// A range of the same kind with new bounds. Kafka partition offsets are dropped.
    pub fn with_bounds(&self, start: i64, end: i64) -> Self {
        match self {
            SegmentRange::Time { .. } => SegmentRange::Time { start, end },
            SegmentRange::Offset { .. } => SegmentRange::Offset { start, end },
            SegmentRange::KafkaOffset { .. } => SegmentRange::KafkaOffset {
                start,
                end,
                partition_offset_start: BTreeMap::new(),
                partition_offset_end: BTreeMap::new(),
            },
        }
    }

    /// Segment name derived from the range: `yyyyMMddHHmmss_yyyyMMddHHmmss` (UTC) for time
    /// ranges, `start_end` for offset ranges, and [`FULL_BUILD_NAME`] for the full build.
    pub fn segment_name(&self) -> String {
        if self.is_full_build() {
            return FULL_BUILD_NAME.to_string();
        }
        match self {
            SegmentRange::Time { start, end } => {
                format!("{}_{}", format_millis(*start), format_millis(*end))
            }
            SegmentRange::Offset { start, end } | SegmentRange::KafkaOffset { start, end, .. } => {
                format!("{start}_{end}")
            }
        }
    }
}

fn format_millis(millis: i64) -> String {
    match DateTime::from_timestamp_millis(millis) {
        Some(ts) => ts.format("%Y%m%d%H%M%S").to_string(),
        None => millis.to_string(),
    }
}

impl fmt::Display for SegmentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {})", self.kind(), self.start(), self.end())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn connects_requires_exact_adjacency() {
        let a = SegmentRange::time(0, 10);
        assert!(a.connects(&SegmentRange::time(10, 20)));
        assert!(!a.connects(&SegmentRange::time(11, 20)));
        assert!(!a.connects(&SegmentRange::time(9, 20)));
        assert!(
            !a.connects(&SegmentRange::offset(10, 20)),
            "ranges of different kinds never connect"
        );
    }

    #[test]
    fn overlap_and_containment() {
        let outer = SegmentRange::offset(0, 100);
        let inner = SegmentRange::offset(10, 20);
        assert!(outer.overlaps(&inner));
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert!(
            !SegmentRange::offset(0, 10).overlaps(&SegmentRange::offset(10, 20)),
            "closed-open ranges sharing a bound do not overlap"
        );
    }

    #[test]
    fn gap_to_spans_uncovered_interval() {
        let gap = SegmentRange::time(0, 10).gap_to(&SegmentRange::time(20, 30));
        assert_eq!(gap, Some(SegmentRange::time(10, 20)));
        assert_eq!(SegmentRange::time(0, 10).gap_to(&SegmentRange::time(10, 30)), None);
        assert_eq!(SegmentRange::time(0, 15).gap_to(&SegmentRange::time(10, 30)), None);
    }

    #[test]
    fn kafka_span_keeps_partition_offsets_of_both_ends() {
        let first = SegmentRange::kafka_offset(
            BTreeMap::from([(0, 0), (1, 0)]),
            BTreeMap::from([(0, 5), (1, 5)]),
        );
        let last = SegmentRange::kafka_offset(
            BTreeMap::from([(0, 5), (1, 5)]),
            BTreeMap::from([(0, 9), (1, 11)]),
        );

        let span = first.span_to(&last);

        assert_eq!(span.start(), 0);
        assert_eq!(span.end(), 20);
        match span {
            SegmentRange::KafkaOffset {
                partition_offset_start,
                partition_offset_end,
                ..
            } => {
                assert_eq!(partition_offset_start, BTreeMap::from([(0, 0), (1, 0)]));
                assert_eq!(partition_offset_end, BTreeMap::from([(0, 9), (1, 11)]));
            }
            other => panic!("expected kafka range, got {other:?}"),
        }
    }

    #[test]
    fn segment_names() {
        assert_eq!(SegmentRange::full_build().segment_name(), FULL_BUILD_NAME);
        assert_eq!(SegmentRange::offset(3, 7).segment_name(), "3_7");
        // 2024-01-01T00:00:00Z .. 2024-01-02T00:00:00Z
        assert_eq!(
            SegmentRange::time(1_704_067_200_000, 1_704_153_600_000).segment_name(),
            "20240101000000_20240102000000"
        );
    }
}
