//! Realization metadata engine.
//!
//! A *dataflow* is the materialized realization of a data model: a range-ordered set of
//! [`Segment`]s, each holding pre-aggregated layouts. This crate keeps that metadata consistent
//! under concurrent writers: segments are appended, refreshed, merged and expired through
//! [`DataflowUpdate`] batches applied with optimistic concurrency on top of a versioned
//! [`ResourceStore`](metadata_store::ResourceStore).
//!
//! Start from a [`MetadataContext`] and ask it for the [`DataflowManager`] of a project.

pub mod build;
pub mod config;
pub mod context;
pub mod dataflow;
pub mod details;
pub mod error;
pub mod fragment;
pub mod ids;
pub mod layout;
pub mod manager;
pub mod merge;
pub mod model;
pub mod range;
pub mod retention;
pub mod segment;
pub mod segments;
pub mod update;

pub use self::{
    build::{LayoutBuildReport, LayoutBuildStats, PartitionBuildStats},
    config::RealizationConfig,
    context::MetadataContext,
    dataflow::{Dataflow, DataflowStatus, SegmentRef},
    details::{SegmentDetails, SegmentDetailsManager},
    error::{Error, ErrorCode, ErrorKind, Result},
    fragment::{FragmentCoverage, FragmentRange, LayoutFragmentDetails, LayoutFragmentManager},
    ids::{BucketId, LayoutId, ModelId, PartitionId, SegmentId},
    layout::{Layout, LayoutIndex, LayoutPartition, LayoutRef},
    manager::DataflowManager,
    merge::{MergeCandidate, MergePlan, plan_merge},
    model::{DataModel, IndexPlan, IndexPlanManager, ModelManager, StorageType},
    range::{RangeKind, SegmentRange},
    retention::{RetentionRange, TimeUnit},
    segment::{PartitionStatus, Segment, SegmentPartition, SegmentStatus},
    update::DataflowUpdate,
};
