//! Event store collaborator.
//!
//! The core only reads from the store through the [`EventStore`] trait:
//! a point-in-time count, a grouped aggregation primitive and a trailing
//! range query. Indexing, persistence and query planning belong to the
//! implementation behind the trait.
//!
//! [`InMemoryEventStore`] is a small reference implementation backing the
//! demo runtime and the tests.

use crate::aggregation::{partition, GroupKey, GroupingValue};
use crate::event::{Event, EventSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(String),
    #[error("store connection lost: {0}")]
    Connection(String),
}

/// Source and inclusive time range a query is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    pub source: EventSource,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        let ts = event.timestamp();
        event.source() == self.source && ts >= self.from && ts <= self.to
    }
}

/// Unordered partial aggregate returned by a store. `key` is `None` when the
/// store could not classify the records.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPartial {
    pub key: Option<GroupingValue>,
    pub count: u64,
    pub sum: f64,
}

/// Query surface of the event store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Count records matching the filter.
    async fn count_matching(&self, filter: &EventFilter) -> Result<u64, StoreError>;

    /// Group records matching the filter and reduce each group to count and sum.
    /// No ordering is promised.
    async fn aggregate(
        &self,
        filter: &EventFilter,
        group_key: GroupKey,
    ) -> Result<Vec<GroupPartial>, StoreError>;

    /// Records of one source within the trailing duration.
    async fn recent_window(
        &self,
        source: EventSource,
        duration: Duration,
    ) -> Result<Vec<Event>, StoreError>;
}

/// Append-only in-memory store.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    events: Arc<RwLock<Vec<Event>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, event: impl Into<Event>) {
        self.events.write().await.push(event.into());
    }

    pub async fn extend(&self, events: impl IntoIterator<Item = Event>) {
        self.events.write().await.extend(events);
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn count_matching(&self, filter: &EventFilter) -> Result<u64, StoreError> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|e| filter.matches(e)).count() as u64)
    }

    async fn aggregate(
        &self,
        filter: &EventFilter,
        group_key: GroupKey,
    ) -> Result<Vec<GroupPartial>, StoreError> {
        let events = self.events.read().await;
        Ok(partition(events.iter().filter(|e| filter.matches(e)), group_key))
    }

    async fn recent_window(
        &self,
        source: EventSource,
        duration: Duration,
    ) -> Result<Vec<Event>, StoreError> {
        let to = Utc::now();
        let from = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|span| to.checked_sub_signed(span))
            .ok_or_else(|| StoreError::Query(format!("window of {:?} is out of range", duration)))?;
        let filter = EventFilter { source, from, to };

        let events = self.events.read().await;
        Ok(events.iter().filter(|e| filter.matches(e)).cloned().collect())
    }
}
