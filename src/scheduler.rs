//! Periodic broadcast of live aggregates to connected subscribers.
//!
//! A single background task ticks at a fixed cadence. Each tick fetches the
//! dashboard and metrics views through the [`QueryService`] (so the snapshot
//! cache absorbs repeated work) and fans the resulting updates out to every
//! registered subscriber concurrently. Every send is bounded by the delivery
//! timeout; subscribers that keep failing are evicted from the registry.
//!
//! Ticks with no subscribers return before touching the query path.

use crate::error::AnalyticsError;
use crate::event::Event;
use crate::protocol::Update;
use crate::query::QueryService;
use crate::registry::{Subscriber, SubscriberId, SubscriptionRegistry, UpdateSink};
use futures::future::join_all;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DASHBOARD_ERROR: &str = "Failed to fetch dashboard data";
const METRICS_ERROR: &str = "Failed to fetch metrics data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSettings {
    pub tick_interval: Duration,
    pub delivery_timeout: Duration,
    pub failure_threshold: u32,
    pub shutdown_grace: Duration,
}

impl BroadcastSettings {
    /// Caps the delivery timeout at half the tick interval so a stuck
    /// subscriber cannot make ticks pile up, and keeps the failure
    /// threshold at one or more.
    pub fn clamped(self) -> Self {
        let cap = self.tick_interval / 2;
        let delivery_timeout = if self.delivery_timeout > cap {
            warn!(
                requested_ms = self.delivery_timeout.as_millis() as u64,
                cap_ms = cap.as_millis() as u64,
                "delivery timeout exceeds half the tick interval; capping"
            );
            cap
        } else {
            self.delivery_timeout
        };
        Self {
            delivery_timeout,
            failure_threshold: self.failure_threshold.max(1),
            ..self
        }
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(1),
            failure_threshold: 3,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Ticking,
    Stopped,
}

/// What happened to one subscriber during a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Failed,
    Evicted,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub evicted: usize,
}

impl AddAssign<Delivery> for DeliveryReport {
    fn add_assign(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Delivered => self.delivered += 1,
            Delivery::Failed => self.failed += 1,
            Delivery::Evicted => self.evicted += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No subscribers were connected
    Skipped,
    /// `updates` payloads were pushed to the registered subscribers
    Broadcast { updates: usize, report: DeliveryReport },
    /// The scheduler has been shut down
    Stopped,
}

pub struct BroadcastScheduler {
    query: Arc<QueryService>,
    registry: Arc<SubscriptionRegistry>,
    settings: BroadcastSettings,
    state: RwLock<SchedulerState>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastScheduler {
    pub fn new(
        query: Arc<QueryService>,
        registry: Arc<SubscriptionRegistry>,
        settings: BroadcastSettings,
    ) -> Self {
        Self {
            query,
            registry,
            settings: settings.clamped(),
            state: RwLock::new(SchedulerState::Idle),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &BroadcastSettings {
        &self.settings
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    pub async fn connected_count(&self) -> usize {
        self.registry.count().await
    }

    /// Spawns the ticking task. The first tick fires one interval from now.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() || self.shutdown.is_cancelled() {
            warn!("broadcast scheduler already started or stopped");
            return;
        }

        let scheduler = self.clone();
        *worker = Some(tokio::spawn(async move { scheduler.run().await }));
        info!(
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            "broadcast scheduler started"
        );
    }

    async fn run(self: Arc<Self>) {
        let period = self.settings.tick_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!("broadcast loop exited");
    }

    /// Runs one broadcast cycle.
    pub async fn tick(&self) -> TickOutcome {
        {
            let mut state = self.state.write().await;
            if *state == SchedulerState::Stopped {
                return TickOutcome::Stopped;
            }
            *state = SchedulerState::Ticking;
        }

        let outcome = self.broadcast_views().await;

        let mut state = self.state.write().await;
        if *state == SchedulerState::Ticking {
            *state = SchedulerState::Idle;
        }
        outcome
    }

    async fn broadcast_views(&self) -> TickOutcome {
        if self.registry.count().await == 0 {
            debug!("no subscribers connected; skipping tick");
            return TickOutcome::Skipped;
        }

        let (dashboard, metrics) = tokio::join!(self.query.dashboard(), self.query.metrics());

        let mut updates = Vec::with_capacity(2);
        match dashboard {
            Ok(dashboard) => updates.push(Arc::new(Update::DashboardUpdate(dashboard))),
            Err(e) => error!(error = %e, "failed to compute dashboard for broadcast"),
        }
        match metrics {
            Ok(metrics) => updates.push(Arc::new(Update::MetricsUpdate(metrics))),
            Err(e) => error!(error = %e, "failed to compute metrics for broadcast"),
        }

        if updates.is_empty() {
            return TickOutcome::Broadcast {
                updates: 0,
                report: DeliveryReport::default(),
            };
        }

        let report = self.fan_out(&updates).await;
        debug!(
            delivered = report.delivered,
            failed = report.failed,
            evicted = report.evicted,
            "tick broadcast complete"
        );
        TickOutcome::Broadcast {
            updates: updates.len(),
            report,
        }
    }

    /// Pushes `updates` to every registered subscriber concurrently and waits
    /// for each attempt to resolve.
    async fn fan_out(&self, updates: &[Arc<Update>]) -> DeliveryReport {
        let subscribers = self.registry.list().await;
        let deliveries = join_all(
            subscribers
                .iter()
                .map(|subscriber| self.deliver(subscriber, updates)),
        )
        .await;

        let mut report = DeliveryReport::default();
        for delivery in deliveries {
            report += delivery;
        }
        report
    }

    /// Sends `updates` in order to one subscriber, stopping at the first
    /// failure. A failure streak reaching the threshold evicts the subscriber.
    async fn deliver(&self, subscriber: &Subscriber, updates: &[Arc<Update>]) -> Delivery {
        for update in updates {
            let reason = match tokio::time::timeout(
                self.settings.delivery_timeout,
                subscriber.sink().send(update.clone()),
            )
            .await
            {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "{} not accepted within {}ms",
                    update.name(),
                    self.settings.delivery_timeout.as_millis()
                ),
            };

            let failure = AnalyticsError::DeliveryFailure {
                subscriber: subscriber.id(),
                reason,
            };
            let streak = subscriber.record_failure();
            warn!(error = %failure, streak, "delivery failed");

            if streak >= self.settings.failure_threshold {
                warn!(subscriber = %subscriber.id(), streak, "evicting unresponsive subscriber");
                self.registry.unregister(subscriber.id()).await;
                return Delivery::Evicted;
            }
            return Delivery::Failed;
        }

        subscriber.record_success();
        Delivery::Delivered
    }

    /// Broadcasts an arbitrary update to all subscribers outside the tick.
    pub async fn broadcast(&self, update: Update) -> DeliveryReport {
        if self.registry.count().await == 0 {
            return DeliveryReport::default();
        }
        self.fan_out(&[Arc::new(update)]).await
    }

    /// Announces a freshly stored record to all subscribers.
    pub async fn publish_event(&self, event: Event) -> DeliveryReport {
        let update = match event {
            Event::UserActivity(activity) => Update::UserActivityUpdate(activity),
            Event::Sale(sale) => Update::SalesDataUpdate(sale),
        };
        self.broadcast(update).await
    }

    /// Registers a subscriber and immediately pushes the full dashboard to it.
    pub async fn on_connect(&self, sink: Arc<dyn UpdateSink>) -> Arc<Subscriber> {
        let subscriber = self.registry.register(sink).await;
        self.push_dashboard(&subscriber).await;
        subscriber
    }

    pub async fn on_disconnect(&self, id: SubscriberId) {
        self.registry.unregister(id).await;
    }

    /// Pushes a fresh dashboard to one subscriber only. Unknown ids are ignored.
    pub async fn on_demand_refresh(&self, id: SubscriberId) -> Option<Delivery> {
        let subscriber = self.registry.get(id).await?;
        debug!(subscriber = %id, "dashboard requested");
        Some(self.push_dashboard(&subscriber).await)
    }

    /// Pushes fresh metrics to one subscriber only. Unknown ids are ignored.
    pub async fn on_demand_metrics(&self, id: SubscriberId) -> Option<Delivery> {
        let subscriber = self.registry.get(id).await?;
        debug!(subscriber = %id, "metrics requested");
        let update = match self.query.metrics().await {
            Ok(metrics) => Update::MetricsUpdate(metrics),
            Err(e) => {
                error!(subscriber = %id, error = %e, "failed to compute metrics");
                Update::Error {
                    message: METRICS_ERROR.to_string(),
                }
            }
        };
        Some(self.deliver(&subscriber, &[Arc::new(update)]).await)
    }

    async fn push_dashboard(&self, subscriber: &Subscriber) -> Delivery {
        let update = match self.query.dashboard().await {
            Ok(dashboard) => Update::DashboardUpdate(dashboard),
            Err(e) => {
                error!(subscriber = %subscriber.id(), error = %e, "failed to compute dashboard");
                Update::Error {
                    message: DASHBOARD_ERROR.to_string(),
                }
            }
        };
        self.deliver(subscriber, &[Arc::new(update)]).await
    }

    /// Stops issuing ticks. An in-flight tick gets the shutdown grace period
    /// to finish its deliveries before it is abandoned.
    pub async fn shutdown(&self) {
        *self.state.write().await = SchedulerState::Stopped;
        self.shutdown.cancel();

        let Some(handle) = self.worker.lock().await.take() else {
            return;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.settings.shutdown_grace, handle).await {
            Ok(Ok(())) => info!("broadcast scheduler stopped"),
            Ok(Err(e)) => error!(error = %e, "broadcast task ended abnormally"),
            Err(_) => {
                warn!(
                    grace_ms = self.settings.shutdown_grace.as_millis() as u64,
                    "abandoning in-flight deliveries"
                );
                abort.abort();
            }
        }
    }
}
