use crate::event::{Sale, UserActivity};
use crate::query::{Dashboard, Metrics};
use serde::Serialize;

/// Message pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Update {
    /// Full dashboard payload
    DashboardUpdate(Dashboard),
    /// Lightweight realtime metrics
    MetricsUpdate(Metrics),
    /// A freshly stored user activity record
    UserActivityUpdate(UserActivity),
    /// A freshly stored sale
    SalesDataUpdate(Sale),
    Error { message: String },
}

impl Update {
    pub fn name(&self) -> &'static str {
        match self {
            Update::DashboardUpdate(_) => "dashboardUpdate",
            Update::MetricsUpdate(_) => "metricsUpdate",
            Update::UserActivityUpdate(_) => "userActivityUpdate",
            Update::SalesDataUpdate(_) => "salesDataUpdate",
            Update::Error { .. } => "error",
        }
    }
}
