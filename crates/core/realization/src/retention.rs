//! Retention and auto-merge planning over calendar windows.
//!
//! Both only apply to time ranges. Calendar arithmetic is done in UTC: weeks start on Monday,
//! months and years are added as calendar months so that window boundaries stay aligned.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeDelta, Timelike, Utc};

use crate::{
    error::Result,
    ids::{ModelId, SegmentId},
    manager::DataflowManager,
    range::SegmentRange,
    segment::{Segment, SegmentStatus},
    update::DataflowUpdate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    /// Start of the window of this unit holding `ts`.
    pub fn window_start(self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = ts.date_naive();
        let start = match self {
            TimeUnit::Hour => date.and_time(NaiveTime::from_hms_opt(ts.hour(), 0, 0)?),
            TimeUnit::Day => date.and_time(NaiveTime::MIN),
            TimeUnit::Week => {
                let offset = i64::from(date.weekday().num_days_from_monday());
                let monday = date.checked_sub_signed(TimeDelta::try_days(offset)?)?;
                monday.and_time(NaiveTime::MIN)
            }
            TimeUnit::Month => {
                NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?.and_time(NaiveTime::MIN)
            }
            TimeUnit::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1)?.and_time(NaiveTime::MIN),
        };
        Some(start.and_utc())
    }

    /// `ts` moved forward by `count` units.
    pub fn add(self, ts: DateTime<Utc>, count: u32) -> Option<DateTime<Utc>> {
        let count_i64 = i64::from(count);
        match self {
            TimeUnit::Hour => ts.checked_add_signed(TimeDelta::try_hours(count_i64)?),
            TimeUnit::Day => ts.checked_add_signed(TimeDelta::try_days(count_i64)?),
            TimeUnit::Week => ts.checked_add_signed(TimeDelta::try_weeks(count_i64)?),
            TimeUnit::Month => ts.checked_add_months(Months::new(count)),
            TimeUnit::Year => ts.checked_add_months(Months::new(count.checked_mul(12)?)),
        }
    }

    /// `ts` moved back by `count` units.
    pub fn sub(self, ts: DateTime<Utc>, count: u32) -> Option<DateTime<Utc>> {
        let count_i64 = i64::from(count);
        match self {
            TimeUnit::Hour => ts.checked_sub_signed(TimeDelta::try_hours(count_i64)?),
            TimeUnit::Day => ts.checked_sub_signed(TimeDelta::try_days(count_i64)?),
            TimeUnit::Week => ts.checked_sub_signed(TimeDelta::try_weeks(count_i64)?),
            TimeUnit::Month => ts.checked_sub_months(Months::new(count)),
            TimeUnit::Year => ts.checked_sub_months(Months::new(count.checked_mul(12)?)),
        }
    }
}

/// How much data a time-partitioned dataflow keeps, counted back from its latest READY segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RetentionRange {
    pub unit: TimeUnit,
    pub count: u32,
}

impl RetentionRange {
    pub fn new(unit: TimeUnit, count: u32) -> Self {
        Self { unit, count }
    }
}

/// The retention cutoff for data ending at `latest_end` (epoch milliseconds).
pub fn retention_cutoff(latest_end: i64, retention: RetentionRange) -> Option<i64> {
    let latest = DateTime::from_timestamp_millis(latest_end)?;
    retention
        .unit
        .sub(latest, retention.count)
        .map(|cutoff| cutoff.timestamp_millis())
}

/// Queryable time segments ending at or before the retention cutoff.
pub fn segments_out_of_retention(segments: &[&Segment], retention: RetentionRange) -> Vec<SegmentId> {
    let latest_end = segments
        .iter()
        .filter(|s| s.status() == SegmentStatus::Ready && is_windowed(s.range()))
        .map(|s| s.range().end())
        .max();
    let Some(cutoff) = latest_end.and_then(|end| retention_cutoff(end, retention)) else {
        return Vec::new();
    };

    segments
        .iter()
        .filter(|s| s.is_queryable() && is_windowed(s.range()) && s.range().end() <= cutoff)
        .map(|s| s.id())
        .collect()
}

/// Finds the next range worth merging: for each unit, largest first, the first closed calendar
/// window holding a run of at least two contiguous READY segments.
///
/// A window is closed once the latest READY segment reaches its end. Segments crossing a window
/// boundary break runs.
pub fn auto_merge_range(segments: &[&Segment], units: &[TimeUnit]) -> Option<SegmentRange> {
    let mut ready: Vec<&Segment> = segments
        .iter()
        .copied()
        .filter(|s| s.status() == SegmentStatus::Ready && is_windowed(s.range()))
        .collect();
    ready.sort_by(|a, b| a.range().cmp_by_start(b.range()));
    let last_end = ready.iter().map(|s| s.range().end()).max()?;

    let mut units = units.to_vec();
    units.sort_unstable_by(|a, b| b.cmp(a));
    units.dedup();

    units
        .into_iter()
        .find_map(|unit| first_mergeable_run(&ready, unit, last_end))
}

fn first_mergeable_run(ready: &[&Segment], unit: TimeUnit, last_end: i64) -> Option<SegmentRange> {
    let mergeable = |run: &[&Segment], window_end: i64| {
        (run.len() >= 2 && window_end <= last_end).then(|| {
            let first = run[0].range();
            first.span_to(run[run.len() - 1].range())
        })
    };

    let mut run: Vec<&Segment> = Vec::new();
    let mut run_window_end = i64::MIN;
    for segment in ready {
        let Some(end) = window_end(unit, segment.range().start()) else {
            run.clear();
            continue;
        };
        if segment.range().end() > end {
            if let Some(range) = mergeable(run.as_slice(), run_window_end) {
                return Some(range);
            }
            run.clear();
            continue;
        }

        let extends = run_window_end == end
            && run
                .last()
                .is_some_and(|last| last.range().connects(segment.range()));
        if !extends {
            if let Some(range) = mergeable(run.as_slice(), run_window_end) {
                return Some(range);
            }
            run.clear();
            run_window_end = end;
        }
        run.push(*segment);
    }
    mergeable(run.as_slice(), run_window_end)
}

/// End of the window of `unit` holding `millis`, in epoch milliseconds.
fn window_end(unit: TimeUnit, millis: i64) -> Option<i64> {
    let start = unit.window_start(DateTime::from_timestamp_millis(millis)?)?;
    unit.add(start, 1).map(|end| end.timestamp_millis())
}

fn is_windowed(range: &SegmentRange) -> bool {
    range.is_time() && !range.is_full_build()
}

impl DataflowManager {
    /// Removes the segments that fell out of retention in one batch update. Returns the ids of
    /// the removed segments. Dataflows partitioned by offsets are left untouched.
    #[tracing::instrument(skip_all, fields(dataflow_id = %id, ?retention), err)]
    pub async fn apply_retention(
        &self,
        id: ModelId,
        retention: RetentionRange,
    ) -> Result<Vec<SegmentId>> {
        let dataflow = self.writable_dataflow(id).await?;
        let segments = self.segments(&dataflow).await?;
        let refs: Vec<&Segment> = segments.iter().map(AsRef::as_ref).collect();

        let expired = segments_out_of_retention(&refs, retention);
        if expired.is_empty() {
            return Ok(expired);
        }

        self.update_dataflow(DataflowUpdate::new(id).remove_segments(expired.iter().copied()))
            .await?;
        tracing::info!(removed = expired.len(), "applied retention");
        Ok(expired)
    }

    /// The next range to merge automatically, if any. See [`auto_merge_range`].
    pub async fn auto_merge_range(
        &self,
        id: ModelId,
        units: &[TimeUnit],
    ) -> Result<Option<SegmentRange>> {
        let ready = self.segments_by_status(id, &[SegmentStatus::Ready]).await?;
        let refs: Vec<&Segment> = ready.iter().map(AsRef::as_ref).collect();
        Ok(auto_merge_range(&refs, units))
    }
}
