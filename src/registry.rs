use crate::protocol::Update;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::info;
use uuid::Uuid;

/// Opaque handle identifying one connected subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SubscriberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
#[error("subscriber sink closed")]
pub struct SinkClosed;

/// Outbound side of a subscriber connection. Implementations may block
/// while the peer is not reading; callers bound every send with a timeout.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn send(&self, update: Arc<Update>) -> Result<(), SinkClosed>;
}

#[async_trait]
impl UpdateSink for mpsc::Sender<Arc<Update>> {
    async fn send(&self, update: Arc<Update>) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, update).await.map_err(|_| SinkClosed)
    }
}

pub struct Subscriber {
    id: SubscriberId,
    sink: Arc<dyn UpdateSink>,
    connected_at: DateTime<Utc>,
    consecutive_failures: AtomicU32,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn sink(&self) -> &dyn UpdateSink {
        self.sink.as_ref()
    }

    /// Bumps the failure streak and returns its new length.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

/// Set of connected subscribers.
///
/// Writes take the map's write lock, so once `unregister` returns no later
/// `list` call can hand out the removed subscriber.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, sink: Arc<dyn UpdateSink>) -> Arc<Subscriber> {
        let subscriber = Arc::new(Subscriber {
            id: SubscriberId::new(),
            sink,
            connected_at: Utc::now(),
            consecutive_failures: AtomicU32::new(0),
        });

        let total = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(subscriber.id, subscriber.clone());
            subscribers.len()
        };
        info!(subscriber = %subscriber.id, total, "subscriber connected");
        subscriber
    }

    /// Registers a subscriber backed by a bounded channel and returns the
    /// receiving end for the transport to drain.
    pub async fn register_channel(
        &self,
        capacity: usize,
    ) -> (Arc<Subscriber>, mpsc::Receiver<Arc<Update>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (self.register(Arc::new(tx)).await, rx)
    }

    /// Removes a subscriber. Unknown ids are ignored.
    pub async fn unregister(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        let (removed, total) = {
            let mut subscribers = self.subscribers.write().await;
            let removed = subscribers.remove(&id);
            (removed, subscribers.len())
        };
        if removed.is_some() {
            info!(subscriber = %id, total, "subscriber disconnected");
        }
        removed
    }

    pub async fn get(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.read().await.get(&id).cloned()
    }

    /// Point-in-time copy of the registered handles.
    pub async fn list(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
