//! Point-query façade over the aggregation engine and snapshot cache.
//!
//! Every lookup goes through the cache first and only reaches the store on a
//! miss. When the store is down, a snapshot younger than the cache's grace
//! bound is served instead; without one the caller gets `StoreUnavailable`
//! rather than zeros, so "empty" and "unknown" stay distinguishable.

use crate::aggregation::{AggregationEngine, Granularity, GroupKey, Snapshot, WindowSpec};
use crate::cache::SnapshotCache;
use crate::error::Result;
use crate::event::EventSource;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Trailing windows behind the standard views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindows {
    pub dashboard: Duration,
    pub metrics: Duration,
    pub aggregate: Duration,
    pub history: Duration,
}

impl Default for QueryWindows {
    fn default() -> Self {
        Self {
            dashboard: Duration::from_secs(24 * 60 * 60),
            metrics: Duration::from_secs(60 * 60),
            aggregate: Duration::from_secs(60 * 60),
            history: Duration::from_secs(365 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    /// Activity counts per action, most frequent first
    pub user_activity: Arc<Snapshot>,
    /// Single total row for sales
    pub sales: Arc<Snapshot>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Activity records seen in the window
    pub active_subjects: u64,
    /// Sales amount in the window
    pub total_measure: f64,
    /// Sales count in the window
    pub count: u64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesSummary {
    pub total_sales: f64,
    pub average_order_value: f64,
    pub total_transactions: u64,
    pub at: DateTime<Utc>,
}

pub struct QueryService {
    engine: AggregationEngine,
    cache: Arc<SnapshotCache>,
    windows: QueryWindows,
}

impl QueryService {
    pub fn new(engine: AggregationEngine, cache: Arc<SnapshotCache>, windows: QueryWindows) -> Self {
        Self { engine, cache, windows }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn windows(&self) -> &QueryWindows {
        &self.windows
    }

    /// Cached snapshot for `spec`, recomputed on a miss.
    pub async fn snapshot(&self, spec: WindowSpec) -> Result<Arc<Snapshot>> {
        let engine = &self.engine;
        match self.cache.get_or_compute(&spec, || engine.compute(&spec)).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) if e.is_retryable() => match self.cache.last_known_good(&spec).await {
                Some(snapshot) => {
                    warn!(window = %spec, error = %e, "serving last known good snapshot");
                    Ok(snapshot)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    pub async fn dashboard(&self) -> Result<Dashboard> {
        let window = self.windows.dashboard;
        let (user_activity, sales) = tokio::try_join!(
            self.snapshot(WindowSpec::new(EventSource::UserActivity, window, GroupKey::Category)),
            self.snapshot(WindowSpec::new(EventSource::Sales, window, GroupKey::None)),
        )?;
        Ok(Dashboard {
            user_activity,
            sales,
            at: Utc::now(),
        })
    }

    pub async fn metrics(&self) -> Result<Metrics> {
        self.metrics_for(self.windows.metrics).await
    }

    pub async fn metrics_for(&self, window: Duration) -> Result<Metrics> {
        let (activity, sales) = tokio::try_join!(
            self.snapshot(WindowSpec::new(EventSource::UserActivity, window, GroupKey::None)),
            self.snapshot(WindowSpec::new(EventSource::Sales, window, GroupKey::None)),
        )?;
        let (active_subjects, _) = activity.totals();
        let (count, total_measure) = sales.totals();
        Ok(Metrics {
            active_subjects,
            total_measure,
            count,
            at: Utc::now(),
        })
    }

    /// User activity over the aggregate window, grouped by `group_key`.
    pub async fn aggregated(&self, group_key: GroupKey) -> Result<Arc<Snapshot>> {
        self.snapshot(WindowSpec::new(EventSource::UserActivity, self.windows.aggregate, group_key))
            .await
    }

    pub async fn sales_summary(&self) -> Result<SalesSummary> {
        let snapshot = self
            .snapshot(WindowSpec::new(EventSource::Sales, self.windows.history, GroupKey::None))
            .await?;
        let (total_transactions, total_sales) = snapshot.totals();
        let average_order_value = snapshot.results.first().map_or(0.0, |r| r.average());
        Ok(SalesSummary {
            total_sales,
            average_order_value,
            total_transactions,
            at: Utc::now(),
        })
    }

    /// Sales bucketed by `daily`, `monthly` or (for anything else) yearly
    /// periods, newest bucket first.
    pub async fn sales_trends(&self, period: &str) -> Result<Arc<Snapshot>> {
        let granularity = Granularity::from_period(period);
        self.snapshot(WindowSpec::new(
            EventSource::Sales,
            self.windows.history,
            GroupKey::TimeBucket(granularity),
        ))
        .await
    }
}
