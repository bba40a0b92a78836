//! Windowed aggregation over business events.
//!
//! This module provides the types and the engine used to turn raw events into
//! grouped metrics. It defines:
//! - Window specifications (event source, trailing duration, grouping key)
//! - Grouping keys and the values records are bucketed under
//! - Per-group results with count, sum and derived average
//! - The `AggregationEngine`, which queries the event store and produces
//!   deterministically ordered snapshots
//!
//! Snapshots produced here are cached and fanned out by the `cache`,
//! `query` and `scheduler` modules.

use crate::error::{AnalyticsError, Result};
use crate::event::{Event, EventSource};
use crate::store::{EventFilter, EventStore, GroupPartial};
use chrono::{DateTime, Datelike, Utc};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Key used for records the grouping function cannot classify.
pub const UNCLASSIFIED_KEY: &str = "__unclassified__";

/// Calendar granularity for time-bucketed grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Month,
    Year,
}

impl Granularity {
    /// Maps a trend period name to a granularity. Unrecognized periods
    /// fall back to yearly buckets.
    pub fn from_period(period: &str) -> Self {
        match period {
            "daily" => Granularity::Day,
            "monthly" => Granularity::Month,
            _ => Granularity::Year,
        }
    }
}

/// Dimension used to partition events before reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    /// Reduce the whole window to a single result
    None,
    /// Action for user activity, product category for sales
    Category,
    /// User id or customer id
    Subject,
    /// Calendar bucket of the event timestamp
    TimeBucket(Granularity),
}

impl Display for GroupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupKey::None => write!(f, "none"),
            GroupKey::Category => write!(f, "category"),
            GroupKey::Subject => write!(f, "subject"),
            GroupKey::TimeBucket(g) => write!(f, "time_bucket({:?})", g),
        }
    }
}

/// A calendar bucket. Coarser granularities leave the finer fields empty, so
/// the derived ordering is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimeBucket {
    pub year: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
}

impl TimeBucket {
    pub fn of(timestamp: DateTime<Utc>, granularity: Granularity) -> Self {
        let year = timestamp.year();
        match granularity {
            Granularity::Year => Self { year, month: None, day: None },
            Granularity::Month => Self { year, month: Some(timestamp.month()), day: None },
            Granularity::Day => Self {
                year,
                month: Some(timestamp.month()),
                day: Some(timestamp.day()),
            },
        }
    }
}

/// The value a group of records shares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupingValue {
    /// The single group produced by `GroupKey::None`
    Total,
    Bucket(TimeBucket),
    Label(String),
    /// Records the grouping function could not classify
    Unclassified,
}

impl Serialize for GroupingValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            GroupingValue::Total => serializer.serialize_none(),
            GroupingValue::Bucket(bucket) => bucket.serialize(serializer),
            GroupingValue::Label(label) => serializer.serialize_str(label),
            GroupingValue::Unclassified => serializer.serialize_str(UNCLASSIFIED_KEY),
        }
    }
}

impl From<&str> for GroupingValue {
    fn from(label: &str) -> Self {
        GroupingValue::Label(label.to_string())
    }
}

/// Aggregate for one group. The average is derived at construction and is
/// zero for an empty group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupResult {
    key: GroupingValue,
    count: u64,
    sum: f64,
    average: f64,
}

impl GroupResult {
    pub fn new(key: GroupingValue, count: u64, sum: f64) -> Self {
        let average = if count == 0 { 0.0 } else { sum / count as f64 };
        Self { key, count, sum, average }
    }

    pub fn key(&self) -> &GroupingValue {
        &self.key
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn average(&self) -> f64 {
        self.average
    }
}

/// Source, trailing duration and grouping of one aggregate view. Two equal
/// specs always share a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSpec {
    pub source: EventSource,
    pub duration: Duration,
    pub group_key: GroupKey,
}

impl WindowSpec {
    pub fn new(source: EventSource, duration: Duration, group_key: GroupKey) -> Self {
        Self { source, duration, group_key }
    }

    pub fn validate(&self) -> Result<()> {
        if self.duration.is_zero() {
            return Err(AnalyticsError::InvalidWindowSpec(format!(
                "{} window must span a positive duration",
                self.source
            )));
        }
        Ok(())
    }

    /// Total order results are sorted by: newest bucket first for time
    /// buckets, otherwise descending count with the key as tie-break.
    fn compare(&self, a: &GroupResult, b: &GroupResult) -> Ordering {
        match self.group_key {
            GroupKey::TimeBucket(_) => b.key.cmp(&a.key),
            _ => b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)),
        }
    }
}

impl Display for WindowSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}s/{}", self.source, self.duration.as_secs(), self.group_key)
    }
}

/// Fully computed, immutable aggregate for one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub window_spec: WindowSpec,
    pub results: Vec<GroupResult>,
    pub computed_at: DateTime<Utc>,
}

impl Snapshot {
    /// Count and sum over every group in the snapshot.
    pub fn totals(&self) -> (u64, f64) {
        self.results
            .iter()
            .fold((0, 0.0), |(count, sum), r| (count + r.count, sum + r.sum))
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.computed_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Returns the group a record belongs to, or `None` when it lacks the field
/// the grouping key reads.
pub fn classify(event: &Event, group_key: GroupKey) -> Option<GroupingValue> {
    match group_key {
        GroupKey::None => Some(GroupingValue::Total),
        GroupKey::Category => event.category().map(GroupingValue::from),
        GroupKey::Subject => event.subject().map(GroupingValue::from),
        GroupKey::TimeBucket(g) => Some(GroupingValue::Bucket(TimeBucket::of(event.timestamp(), g))),
    }
}

/// Partitions events by group key into unordered partial aggregates.
///
/// This is the grouping primitive stores without native aggregation can
/// delegate to.
pub fn partition<'a, I>(events: I, group_key: GroupKey) -> Vec<GroupPartial>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut groups: BTreeMap<Option<GroupingValue>, (u64, f64)> = BTreeMap::new();
    for event in events {
        let entry = groups.entry(classify(event, group_key)).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += event.measure();
    }
    groups
        .into_iter()
        .map(|(key, (count, sum))| GroupPartial { key, count, sum })
        .collect()
}

/// Merges partials, buckets unclassifiable ones under the sentinel key and
/// sorts the results by the window's total order.
pub fn reduce(spec: &WindowSpec, partials: Vec<GroupPartial>) -> Vec<GroupResult> {
    let mut merged: BTreeMap<GroupingValue, (u64, f64)> = BTreeMap::new();
    for partial in partials {
        let key = partial.key.unwrap_or(GroupingValue::Unclassified);
        let entry = merged.entry(key).or_insert((0, 0.0));
        entry.0 += partial.count;
        entry.1 += partial.sum;
    }

    let mut results: Vec<GroupResult> = merged
        .into_iter()
        .map(|(key, (count, sum))| GroupResult::new(key, count, sum))
        .collect();
    results.sort_by(|a, b| spec.compare(a, b));
    results
}

/// Computes snapshots by issuing one bounded range query per window.
#[derive(Clone)]
pub struct AggregationEngine {
    store: Arc<dyn EventStore>,
    store_timeout: Duration,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn EventStore>, store_timeout: Duration) -> Self {
        Self { store, store_timeout }
    }

    /// Aggregates `[now - duration, now]` for the given window.
    ///
    /// Store failures and timeouts surface as `StoreUnavailable`; no partial
    /// snapshot is ever returned.
    pub async fn compute(&self, spec: &WindowSpec) -> Result<Snapshot> {
        spec.validate()?;

        let to = Utc::now();
        let from = chrono::Duration::from_std(spec.duration)
            .ok()
            .and_then(|span| to.checked_sub_signed(span))
            .ok_or_else(|| {
                AnalyticsError::InvalidWindowSpec(format!("{} reaches past the earliest timestamp", spec))
            })?;
        let filter = EventFilter {
            source: spec.source,
            from,
            to,
        };

        let partials = tokio::time::timeout(
            self.store_timeout,
            self.store.aggregate(&filter, spec.group_key),
        )
        .await
        .map_err(|_| {
            AnalyticsError::StoreUnavailable(format!(
                "aggregate for {} exceeded {}ms",
                spec,
                self.store_timeout.as_millis()
            ))
        })?
        .map_err(|e| AnalyticsError::StoreUnavailable(e.to_string()))?;

        let results = reduce(spec, partials);
        debug!(window = %spec, groups = results.len(), "computed snapshot");

        Ok(Snapshot {
            window_spec: *spec,
            results,
            computed_at: to,
        })
    }
}
