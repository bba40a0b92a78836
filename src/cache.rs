//! Snapshot cache shared by point queries and the broadcast scheduler.
//!
//! Each `WindowSpec` owns one slot holding at most one live snapshot. A slot
//! also carries its own refresh lock, so recomputation is serialized per
//! window while unrelated windows refresh in parallel. Requesters that queue
//! on the refresh lock re-check the slot once they get it and take whatever
//! the refresh they waited on produced, snapshot or error.

use crate::aggregation::{Snapshot, WindowSpec};
use crate::error::{AnalyticsError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Default)]
struct Slot {
    current: RwLock<Option<Arc<Snapshot>>>,
    refresh: Mutex<()>,
    /// Bumped, under the refresh lock, each time a refresh finishes
    refreshes: AtomicU64,
    /// Error of the latest refresh, cleared by the next success
    failure: RwLock<Option<AnalyticsError>>,
}

pub struct SnapshotCache {
    slots: RwLock<HashMap<WindowSpec, Arc<Slot>>>,
    default_staleness: Duration,
    staleness: HashMap<WindowSpec, Duration>,
    stale_grace: Duration,
}

impl SnapshotCache {
    /// Creates a cache where snapshots stay fresh for `default_staleness` and
    /// may be served as last-known-good for up to `stale_grace`.
    pub fn new(default_staleness: Duration, stale_grace: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            default_staleness,
            staleness: HashMap::new(),
            stale_grace,
        }
    }

    /// Overrides the staleness bound for a single window.
    pub fn with_staleness(mut self, spec: WindowSpec, bound: Duration) -> Self {
        self.staleness.insert(spec, bound);
        self
    }

    pub fn staleness_for(&self, spec: &WindowSpec) -> Duration {
        self.staleness.get(spec).copied().unwrap_or(self.default_staleness)
    }

    /// Returns the cached snapshot if it is still within the staleness bound.
    pub async fn get(&self, spec: &WindowSpec) -> Option<Arc<Snapshot>> {
        let slot = self.slots.read().await.get(spec).cloned()?;
        self.fresh(spec, &slot).await
    }

    /// Replaces the snapshot for `spec` wholesale.
    pub async fn put(&self, spec: &WindowSpec, snapshot: Snapshot) -> Arc<Snapshot> {
        let slot = self.slot(spec).await;
        Self::replace(&slot, snapshot).await
    }

    /// Drops every snapshot older than `age` and forgets windows left
    /// without a snapshot that no requester is using. Returns how many
    /// snapshots were dropped.
    pub async fn invalidate_older_than(&self, age: Duration) -> usize {
        let now = Utc::now();
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();

        let mut dropped = 0;
        for slot in slots {
            let mut current = slot.current.write().await;
            if current.as_ref().is_some_and(|s| s.age(now) > age) {
                *current = None;
                dropped += 1;
            }
        }

        let mut slots = self.slots.write().await;
        let before = slots.len();
        // The map's write lock is held, so a strong count of one means no
        // requester can be holding or about to take this slot.
        slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot.current.try_read().map_or(true, |current| current.is_some())
        });
        let removed = before - slots.len();

        if dropped > 0 || removed > 0 {
            debug!(dropped, removed, "invalidated aged snapshots");
        }
        dropped
    }

    /// Number of windows the cache is tracking, with or without a snapshot.
    pub async fn tracked_windows(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Last snapshot for `spec` if it is no older than the extended grace
    /// bound, regardless of the regular staleness bound.
    pub async fn last_known_good(&self, spec: &WindowSpec) -> Option<Arc<Snapshot>> {
        let slot = self.slots.read().await.get(spec).cloned()?;
        let current = slot.current.read().await;
        current
            .as_ref()
            .filter(|s| s.age(Utc::now()) <= self.stale_grace)
            .cloned()
    }

    /// Returns a fresh snapshot, running `compute` on a miss. At most one
    /// `compute` per window runs at a time; concurrent callers for the same
    /// window wait for it and share its result.
    pub async fn get_or_compute<F, Fut>(&self, spec: &WindowSpec, compute: F) -> Result<Arc<Snapshot>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Snapshot>>,
    {
        if let Some(snapshot) = self.get(spec).await {
            return Ok(snapshot);
        }

        let slot = self.slot(spec).await;
        let seen = slot.refreshes.load(Ordering::Acquire);
        let _refresh = slot.refresh.lock().await;

        if let Some(snapshot) = self.fresh(spec, &slot).await {
            debug!(window = %spec, "coalesced onto in-flight refresh");
            return Ok(snapshot);
        }
        if slot.refreshes.load(Ordering::Acquire) != seen {
            if let Some(e) = slot.failure.read().await.clone() {
                debug!(window = %spec, "coalesced onto failed refresh");
                return Err(e);
            }
        }

        let outcome = compute().await;
        let result = match outcome {
            Ok(snapshot) => {
                *slot.failure.write().await = None;
                Ok(Self::replace(&slot, snapshot).await)
            }
            Err(e) => {
                warn!(window = %spec, error = %e, "snapshot refresh failed");
                *slot.failure.write().await = Some(e.clone());
                Err(e)
            }
        };
        slot.refreshes.fetch_add(1, Ordering::Release);
        result
    }

    pub async fn len(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        let mut live = 0;
        for slot in slots {
            if slot.current.read().await.is_some() {
                live += 1;
            }
        }
        live
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn slot(&self, spec: &WindowSpec) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().await.get(spec) {
            return slot.clone();
        }
        self.slots.write().await.entry(*spec).or_default().clone()
    }

    async fn fresh(&self, spec: &WindowSpec, slot: &Slot) -> Option<Arc<Snapshot>> {
        let bound = self.staleness_for(spec);
        let current = slot.current.read().await;
        current
            .as_ref()
            .filter(|s| s.age(Utc::now()) <= bound)
            .cloned()
    }

    async fn replace(slot: &Slot, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *slot.current.write().await = Some(snapshot.clone());
        snapshot
    }
}
