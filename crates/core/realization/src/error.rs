//! Error taxonomy of the realization engine.
//!
//! Every [`Error`] belongs to one [`ErrorKind`]. Consistency errors additionally carry an
//! [`ErrorCode`] that lets callers decide whether to retry with `force` or a smaller range.

use std::{collections::BTreeSet, fmt};

use metadata_store::{CrudError, RetriesExhausted, RetryableErrorExt, SharedEntityError};

use crate::{
    ids::{LayoutId, ModelId, PartitionId, SegmentId},
    range::{RangeKind, SegmentRange},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Illegal arguments. Surfaced immediately, never retried.
    Validation,
    /// Domain checks failed on otherwise valid input. Carries an [`ErrorCode`].
    Consistency,
    /// Concurrent writers kept winning until the retry budget ran out.
    Conflict,
    /// The realization is BROKEN and rejects writes.
    Degraded,
    /// The resource store failed.
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    CheckIndexIllegal,
    CheckPartitionIllegal,
    SegmentContainsGaps,
    SegmentMergeCheckEmpty,
    MergeStorageQuotaExceeded,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CheckIndexIllegal => "CHECK_INDEX_ILLEGAL",
            ErrorCode::CheckPartitionIllegal => "CHECK_PARTITION_ILLEGAL",
            ErrorCode::SegmentContainsGaps => "SEGMENT_CONTAINS_GAPS",
            ErrorCode::SegmentMergeCheckEmpty => "SEGMENT_MERGE_CHECK_EMPTY",
            ErrorCode::MergeStorageQuotaExceeded => "MERGE_STORAGE_QUOTA_EXCEEDED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No dataflow exists under the given id.
    #[error("dataflow {0} not found")]
    DataflowNotFound(ModelId),

    /// A dataflow already exists for the index plan.
    #[error("dataflow {0} already exists")]
    DataflowAlreadyExists(ModelId),

    /// The model the dataflow is built from does not exist.
    #[error("model {0} not found")]
    ModelNotFound(ModelId),

    /// The index plan the dataflow is bound to does not exist.
    #[error("index plan {0} not found")]
    IndexPlanNotFound(ModelId),

    /// The segment is not part of the dataflow.
    #[error("segment {segment} not found in dataflow {dataflow}")]
    SegmentNotFound { dataflow: ModelId, segment: SegmentId },

    /// Refresh was requested for a range no segment owns exactly.
    #[error("no segment of dataflow {dataflow} covers exactly {range}")]
    NoSegmentForRange {
        dataflow: ModelId,
        range: SegmentRange,
    },

    /// Two segment ranges overlap in a way no merge or refresh explains.
    #[error(
        "segments of dataflow {dataflow} overlap: {first} {first_range} and {second} {second_range}"
    )]
    OverlappingSegments {
        dataflow: ModelId,
        first: String,
        first_range: SegmentRange,
        second: String,
        second_range: SegmentRange,
    },

    /// A segment range is not of the kind used by the existing segments.
    #[error("segment range {range} of dataflow {dataflow} is not a {expected} range")]
    RangeKindMismatch {
        dataflow: ModelId,
        range: SegmentRange,
        expected: RangeKind,
    },

    /// Merge was requested on a dataflow without segments.
    #[error("dataflow {0} has no segments to merge")]
    NoSegments(ModelId),

    /// Merge was requested on a model without partition column.
    #[error("model {0} has no partition column, its only segment cannot be merged")]
    NoPartitionColumn(ModelId),

    /// Fewer than two segments fall within the merge range.
    #[error("merging {range} in dataflow {dataflow} needs at least 2 segments, found {found}")]
    NotEnoughSegmentsToMerge {
        dataflow: ModelId,
        range: SegmentRange,
        found: usize,
    },

    /// Multi-partition values unknown to the model.
    #[error("model {model} has no partitions {values:?}")]
    UnknownPartitionValues {
        model: ModelId,
        values: Vec<Vec<String>>,
    },

    /// The model is not multi-partitioned.
    #[error("model {0} is not multi-partitioned")]
    NotMultiPartitioned(ModelId),

    /// BROKEN is derived from missing dependencies and cannot be set.
    #[error("status BROKEN of dataflow {0} cannot be set explicitly")]
    BrokenStatusNotSettable(ModelId),

    /// An entity shared through the cache was mutated in place.
    #[error(transparent)]
    SharedEntity(#[from] SharedEntityError),

    /// Merging segments do not materialize the same layouts.
    #[error(
        "[{}] segment {segment} has layouts {actual:?}, segment {first_segment} has {expected:?}",
        ErrorCode::CheckIndexIllegal
    )]
    LayoutMismatch {
        first_segment: String,
        segment: String,
        expected: BTreeSet<LayoutId>,
        actual: BTreeSet<LayoutId>,
    },

    /// Merging segments do not carry the same partitions.
    #[error(
        "[{}] segment {segment} has partitions {actual:?}, expected {expected:?}",
        ErrorCode::CheckPartitionIllegal
    )]
    PartitionMismatch {
        segment: String,
        expected: BTreeSet<PartitionId>,
        actual: BTreeSet<PartitionId>,
    },

    /// Merging segments are not contiguous.
    #[error(
        "[{}] segments {before} and {after} do not connect, merge with force to allow gaps",
        ErrorCode::SegmentContainsGaps
    )]
    SegmentsContainGaps { before: String, after: String },

    /// Merging segments hold no rows.
    #[error(
        "[{}] segments {segments:?} are empty, merge with force to include them",
        ErrorCode::SegmentMergeCheckEmpty
    )]
    EmptySegments { segments: Vec<String> },

    /// Merging segments exceed the merge storage quota.
    #[error(
        "[{}] merging {bytes} bytes exceeds the quota of {quota} bytes",
        ErrorCode::MergeStorageQuotaExceeded
    )]
    MergeQuotaExceeded { bytes: i64, quota: i64 },

    /// The dataflow's model or index plan is missing.
    #[error("dataflow {0} is BROKEN, its model or index plan is unreadable")]
    DataflowBroken(ModelId),

    /// A unit of work kept conflicting with concurrent writers.
    #[error(transparent)]
    RetriesExhausted(#[from] RetriesExhausted),

    /// The cached resource layer failed.
    #[error("metadata store operation failed")]
    Crud(#[from] CrudError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DataflowNotFound(_)
            | Error::DataflowAlreadyExists(_)
            | Error::ModelNotFound(_)
            | Error::IndexPlanNotFound(_)
            | Error::SegmentNotFound { .. }
            | Error::NoSegmentForRange { .. }
            | Error::OverlappingSegments { .. }
            | Error::RangeKindMismatch { .. }
            | Error::NoSegments(_)
            | Error::NoPartitionColumn(_)
            | Error::NotEnoughSegmentsToMerge { .. }
            | Error::UnknownPartitionValues { .. }
            | Error::NotMultiPartitioned(_)
            | Error::BrokenStatusNotSettable(_)
            | Error::SharedEntity(_) => ErrorKind::Validation,
            Error::LayoutMismatch { .. }
            | Error::PartitionMismatch { .. }
            | Error::SegmentsContainGaps { .. }
            | Error::EmptySegments { .. }
            | Error::MergeQuotaExceeded { .. } => ErrorKind::Consistency,
            Error::DataflowBroken(_) => ErrorKind::Degraded,
            Error::RetriesExhausted(_) => ErrorKind::Conflict,
            Error::Crud(err) if err.is_version_conflict() => ErrorKind::Conflict,
            Error::Crud(_) => ErrorKind::Storage,
        }
    }

    /// Code of a consistency error, `None` for every other kind.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::LayoutMismatch { .. } => Some(ErrorCode::CheckIndexIllegal),
            Error::PartitionMismatch { .. } => Some(ErrorCode::CheckPartitionIllegal),
            Error::SegmentsContainGaps { .. } => Some(ErrorCode::SegmentContainsGaps),
            Error::EmptySegments { .. } => Some(ErrorCode::SegmentMergeCheckEmpty),
            Error::MergeQuotaExceeded { .. } => Some(ErrorCode::MergeStorageQuotaExceeded),
            _ => None,
        }
    }
}

impl RetryableErrorExt for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Crud(err) => err.is_retryable(),
            _ => false,
        }
    }
}
