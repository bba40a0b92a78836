use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Which stream of business records a window reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    UserActivity,
    Sales,
}

impl Display for EventSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::UserActivity => write!(f, "user_activity"),
            EventSource::Sales => write!(f, "sales"),
        }
    }
}

/// A user interaction as recorded upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActivity {
    pub user_id: String,
    pub action: Option<String>,
    pub page: Option<String>,
    /// Seconds spent; absent durations aggregate as zero.
    pub duration: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// A completed sale. Amounts are expected in integer minor units when exact
/// totals matter; they are summed as `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub product_id: String,
    pub product_name: String,
    pub customer_id: String,
    pub amount: f64,
    pub quantity: u32,
    pub category: Option<String>,
    pub region: Option<String>,
    pub sales_rep: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Read-only copy of a stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    UserActivity(UserActivity),
    Sale(Sale),
}

impl Event {
    pub fn source(&self) -> EventSource {
        match self {
            Event::UserActivity(_) => EventSource::UserActivity,
            Event::Sale(_) => EventSource::Sales,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::UserActivity(a) => a.timestamp,
            Event::Sale(s) => s.timestamp,
        }
    }

    /// The user or customer the record is about. Blank ids count as missing.
    pub fn subject(&self) -> Option<&str> {
        let id = match self {
            Event::UserActivity(a) => a.user_id.as_str(),
            Event::Sale(s) => s.customer_id.as_str(),
        };
        non_blank(Some(id))
    }

    /// Action for activities, product category for sales.
    pub fn category(&self) -> Option<&str> {
        match self {
            Event::UserActivity(a) => non_blank(a.action.as_deref()),
            Event::Sale(s) => non_blank(s.category.as_deref()),
        }
    }

    /// Duration for activities, amount for sales.
    pub fn measure(&self) -> f64 {
        match self {
            Event::UserActivity(a) => a.duration.unwrap_or(0.0),
            Event::Sale(s) => s.amount,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

impl From<UserActivity> for Event {
    fn from(activity: UserActivity) -> Self {
        Event::UserActivity(activity)
    }
}

impl From<Sale> for Event {
    fn from(sale: Sale) -> Self {
        Event::Sale(sale)
    }
}
