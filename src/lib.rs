//! Pulsewire: windowed business aggregates with live fan-out
//!
//! This library keeps derived views over a stream of user-activity and sales
//! records fresh for two kinds of consumers: point queries answered on demand
//! and subscribers receiving pushed updates at a fixed cadence.
//!
//! # Example
//!
//! ```rust,no_run
//! use pulsewire::{
//!     AggregationEngine, BroadcastScheduler, GroupKey, InMemoryEventStore, QueryService,
//!     Settings, SnapshotCache, SubscriptionRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::new()?;
//!
//!     // Any EventStore works here; the in-memory one is handy for trials
//!     let store = Arc::new(InMemoryEventStore::new());
//!     let engine = AggregationEngine::new(store, settings.store_timeout());
//!     let cache = Arc::new(SnapshotCache::new(settings.snapshot_staleness(), settings.stale_grace()));
//!     let query = Arc::new(QueryService::new(engine, cache, settings.query_windows()));
//!
//!     // Point query
//!     let by_action = query.aggregated(GroupKey::Category).await?;
//!     println!("{:?}", by_action.results);
//!
//!     // Live updates
//!     let registry = Arc::new(SubscriptionRegistry::new());
//!     let scheduler = Arc::new(BroadcastScheduler::new(query, registry.clone(), settings.broadcast()));
//!     scheduler.start().await;
//!
//!     let (subscriber, mut updates) = registry.register_channel(settings.subscriber_buffer).await;
//!     if let Some(update) = updates.recv().await {
//!         println!("{} -> {}", subscriber.id(), update.name());
//!     }
//!
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod aggregation;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod tests;

pub use aggregation::{
    AggregationEngine, Granularity, GroupKey, GroupResult, GroupingValue, Snapshot, TimeBucket,
    WindowSpec, UNCLASSIFIED_KEY,
};
pub use cache::SnapshotCache;
pub use config::{CliArgs, Settings};
pub use error::{AnalyticsError, Result};
pub use event::{Event, EventSource, Sale, UserActivity};
pub use protocol::Update;
pub use query::{Dashboard, Metrics, QueryService, QueryWindows, SalesSummary};
pub use registry::{SinkClosed, Subscriber, SubscriberId, SubscriptionRegistry, UpdateSink};
pub use scheduler::{
    BroadcastScheduler, BroadcastSettings, Delivery, DeliveryReport, SchedulerState, TickOutcome,
};
pub use store::{EventFilter, EventStore, GroupPartial, InMemoryEventStore, StoreError};
