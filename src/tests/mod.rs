#[cfg(test)]
mod tests {
    use crate::aggregation::{AggregationEngine, Granularity, GroupKey, GroupingValue, Snapshot, WindowSpec};
    use crate::cache::SnapshotCache;
    use crate::error::AnalyticsError;
    use crate::event::{Event, EventSource, Sale, UserActivity};
    use crate::protocol::Update;
    use crate::query::{QueryService, QueryWindows};
    use crate::registry::{SinkClosed, SubscriptionRegistry, UpdateSink};
    use crate::scheduler::{BroadcastScheduler, BroadcastSettings, Delivery, SchedulerState, TickOutcome};
    use crate::store::{EventFilter, EventStore, GroupPartial, InMemoryEventStore, StoreError};
    use async_trait::async_trait;
    use chrono::Utc;
    use mockall::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    mock! {
        pub Store {}
        #[async_trait]
        impl EventStore for Store {
            async fn count_matching(&self, filter: &EventFilter) -> Result<u64, StoreError>;
            async fn aggregate(&self, filter: &EventFilter, group_key: GroupKey) -> Result<Vec<GroupPartial>, StoreError>;
            async fn recent_window(&self, source: EventSource, duration: Duration) -> Result<Vec<Event>, StoreError>;
        }
    }

    mock! {
        pub Sink {}
        #[async_trait]
        impl UpdateSink for Sink {
            async fn send(&self, update: Arc<Update>) -> Result<(), SinkClosed>;
        }
    }

    /// Sink whose peer never reads.
    struct StalledSink;

    #[async_trait]
    impl UpdateSink for StalledSink {
        async fn send(&self, _update: Arc<Update>) -> Result<(), SinkClosed> {
            std::future::pending().await
        }
    }

    /// Store that never answers.
    struct StalledStore;

    #[async_trait]
    impl EventStore for StalledStore {
        async fn count_matching(&self, _filter: &EventFilter) -> Result<u64, StoreError> {
            std::future::pending().await
        }

        async fn aggregate(&self, _filter: &EventFilter, _group_key: GroupKey) -> Result<Vec<GroupPartial>, StoreError> {
            std::future::pending().await
        }

        async fn recent_window(&self, _source: EventSource, _duration: Duration) -> Result<Vec<Event>, StoreError> {
            std::future::pending().await
        }
    }

    fn activity(action: &str, duration: Option<f64>) -> Event {
        Event::from(UserActivity {
            user_id: format!("user-{}", action.len()),
            action: Some(action.to_string()),
            page: Some("/dashboard".to_string()),
            duration,
            timestamp: Utc::now() - chrono::Duration::minutes(5),
        })
    }

    fn sale(amount: f64, age: chrono::Duration) -> Event {
        Event::from(Sale {
            product_id: "p-7".to_string(),
            product_name: "Headphones".to_string(),
            customer_id: "c-3".to_string(),
            amount,
            quantity: 1,
            category: Some("Electronics".to_string()),
            region: Some("Asia Pacific".to_string()),
            sales_rep: Some("rep-1".to_string()),
            timestamp: Utc::now() - age,
        })
    }

    fn total(count: u64, sum: f64) -> GroupPartial {
        GroupPartial {
            key: Some(GroupingValue::Total),
            count,
            sum,
        }
    }

    fn query_service(store: Arc<dyn EventStore>, staleness: Duration) -> Arc<QueryService> {
        let engine = AggregationEngine::new(store, Duration::from_secs(2));
        let cache = Arc::new(SnapshotCache::new(staleness, Duration::from_secs(60)));
        Arc::new(QueryService::new(engine, cache, QueryWindows::default()))
    }

    fn scheduler(query: Arc<QueryService>, failure_threshold: u32) -> Arc<BroadcastScheduler> {
        let settings = BroadcastSettings {
            tick_interval: Duration::from_millis(200),
            delivery_timeout: Duration::from_millis(50),
            failure_threshold,
            shutdown_grace: Duration::from_millis(100),
        };
        Arc::new(BroadcastScheduler::new(query, Arc::new(SubscriptionRegistry::new()), settings))
    }

    async fn seeded_store() -> Arc<InMemoryEventStore> {
        let store = Arc::new(InMemoryEventStore::new());
        store
            .extend(vec![
                activity("purchase", Some(10.0)),
                activity("purchase", Some(20.0)),
                activity("purchase", Some(30.0)),
                activity("click", None),
                activity("click", None),
                sale(100.0, chrono::Duration::minutes(10)),
                sale(50.0, chrono::Duration::minutes(20)),
            ])
            .await;
        store
    }

    #[tokio::test]
    async fn test_aggregated_by_category() {
        let query = query_service(seeded_store().await, Duration::from_secs(5));

        let snapshot = query.aggregated(GroupKey::Category).await.unwrap();
        let results = &snapshot.results;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].key(), &GroupingValue::from("purchase"));
        assert_eq!(results[0].count(), 3);
        assert_eq!(results[0].sum(), 60.0);
        assert_eq!(results[0].average(), 20.0);
        assert_eq!(results[1].key(), &GroupingValue::from("click"));
        assert_eq!(results[1].count(), 2);
        assert_eq!(results[1].sum(), 0.0);
        assert_eq!(results[1].average(), 0.0);
    }

    #[tokio::test]
    async fn test_repeat_query_within_staleness_reuses_snapshot() {
        let mut store = MockStore::new();
        store.expect_aggregate()
            .times(1)
            .returning(|_, _| Ok(vec![total(2, 30.0)]));

        let query = query_service(Arc::new(store), Duration::from_secs(30));
        let first = query.aggregated(GroupKey::None).await.unwrap();
        let second = query.aggregated(GroupKey::None).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requesters_share_one_store_query() {
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();

        let mut store = MockStore::new();
        store.expect_aggregate()
            .returning(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![total(1, 5.0)])
            });

        let query = query_service(Arc::new(store), Duration::from_secs(30));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let query = query.clone();
            handles.push(tokio::spawn(async move {
                query.aggregated(GroupKey::None).await
            }));
        }

        let mut snapshots = Vec::new();
        for handle in handles {
            snapshots.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(queries.load(Ordering::SeqCst), 1);
        assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
    }

    #[tokio::test]
    async fn test_store_failure_is_reported_not_zeroed() {
        let mut store = MockStore::new();
        store.expect_aggregate()
            .returning(|_, _| Err(StoreError::Connection("reset by peer".to_string())));

        let query = query_service(Arc::new(store), Duration::from_secs(5));
        let result = query.metrics().await;

        let err = result.unwrap_err();
        assert!(matches!(err, AnalyticsError::StoreUnavailable(_)));
        assert!(err.to_string().contains("temporarily unavailable"));
    }

    #[tokio::test]
    async fn test_last_known_good_served_during_outage() {
        let mut store = MockStore::new();
        store.expect_aggregate()
            .times(1)
            .returning(|_, _| Err(StoreError::Query("timeout".to_string())));

        let query = query_service(Arc::new(store), Duration::from_secs(5));
        let spec = WindowSpec::new(EventSource::Sales, QueryWindows::default().history, GroupKey::None);
        let stale = query
            .cache()
            .put(
                &spec,
                Snapshot {
                    window_spec: spec,
                    results: Vec::new(),
                    computed_at: Utc::now() - chrono::Duration::seconds(20),
                },
            )
            .await;

        let served = query.snapshot(spec).await.unwrap();
        assert!(Arc::ptr_eq(&served, &stale));
    }

    #[tokio::test]
    async fn test_invalid_window_never_reaches_store() {
        let mut store = MockStore::new();
        store.expect_aggregate().times(0);

        let query = query_service(Arc::new(store), Duration::from_secs(5));
        let spec = WindowSpec::new(EventSource::UserActivity, Duration::ZERO, GroupKey::Category);
        let result = query.snapshot(spec).await;

        assert!(matches!(result, Err(AnalyticsError::InvalidWindowSpec(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let engine = AggregationEngine::new(Arc::new(StalledStore), Duration::from_millis(100));
        let spec = WindowSpec::new(EventSource::Sales, Duration::from_secs(60), GroupKey::None);

        let result = engine.compute(&spec).await;
        assert!(matches!(result, Err(AnalyticsError::StoreUnavailable(_))));
    }

    #[tokio::test]
    async fn test_unclassified_partials_from_store_are_merged() {
        let mut store = MockStore::new();
        store.expect_aggregate()
            .returning(|_, _| {
                Ok(vec![
                    GroupPartial { key: None, count: 1, sum: 4.0 },
                    GroupPartial { key: Some(GroupingValue::from("login")), count: 3, sum: 9.0 },
                    GroupPartial { key: Some(GroupingValue::Unclassified), count: 1, sum: 2.0 },
                ])
            });

        let query = query_service(Arc::new(store), Duration::from_secs(5));
        let snapshot = query.aggregated(GroupKey::Category).await.unwrap();

        assert_eq!(snapshot.results.len(), 2);
        assert_eq!(snapshot.results[0].key(), &GroupingValue::from("login"));
        assert_eq!(snapshot.results[1].key(), &GroupingValue::Unclassified);
        assert_eq!(snapshot.results[1].count(), 2);
        assert_eq!(snapshot.results[1].average(), 3.0);
    }

    #[tokio::test]
    async fn test_metrics_and_summary() {
        let query = query_service(seeded_store().await, Duration::from_secs(5));

        let metrics = query.metrics().await.unwrap();
        assert_eq!(metrics.active_subjects, 5);
        assert_eq!(metrics.count, 2);
        assert_eq!(metrics.total_measure, 150.0);

        let summary = query.sales_summary().await.unwrap();
        assert_eq!(summary.total_transactions, 2);
        assert_eq!(summary.total_sales, 150.0);
        assert_eq!(summary.average_order_value, 75.0);
    }

    #[tokio::test]
    async fn test_empty_store_renders_zeros() {
        let query = query_service(Arc::new(InMemoryEventStore::new()), Duration::from_secs(5));

        let metrics = query.metrics().await.unwrap();
        assert_eq!(metrics.active_subjects, 0);
        assert_eq!(metrics.count, 0);
        assert_eq!(metrics.total_measure, 0.0);

        let summary = query.sales_summary().await.unwrap();
        assert_eq!(summary.total_transactions, 0);
        assert_eq!(summary.average_order_value, 0.0);

        let dashboard = query.dashboard().await.unwrap();
        assert!(dashboard.user_activity.results.is_empty());
        assert!(dashboard.sales.results.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_trend_period_uses_yearly_buckets() {
        let query = query_service(seeded_store().await, Duration::from_secs(5));

        let weekly = query.sales_trends("weekly").await.unwrap();
        let yearly = query.sales_trends("yearly").await.unwrap();

        assert_eq!(weekly.window_spec.group_key, GroupKey::TimeBucket(Granularity::Year));
        assert!(Arc::ptr_eq(&weekly, &yearly));
        for result in &weekly.results {
            match result.key() {
                GroupingValue::Bucket(bucket) => {
                    assert!(bucket.month.is_none());
                    assert!(bucket.day.is_none());
                }
                other => panic!("unexpected key {:?}", other),
            }
        }

        let daily = query.sales_trends("daily").await.unwrap();
        assert_eq!(daily.window_spec.group_key, GroupKey::TimeBucket(Granularity::Day));
    }

    #[tokio::test]
    async fn test_tick_without_subscribers_skips_aggregation() {
        let mut store = MockStore::new();
        store.expect_aggregate().times(0);

        let scheduler = scheduler(query_service(Arc::new(store), Duration::from_secs(5)), 3);
        assert_eq!(scheduler.tick().await, TickOutcome::Skipped);
        assert_eq!(scheduler.state().await, SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_scheduler_caps_delivery_timeout() {
        let settings = BroadcastSettings {
            tick_interval: Duration::from_millis(1000),
            delivery_timeout: Duration::from_millis(900),
            failure_threshold: 0,
            shutdown_grace: Duration::from_millis(100),
        };
        let query = query_service(Arc::new(InMemoryEventStore::new()), Duration::from_secs(5));
        let scheduler = BroadcastScheduler::new(query, Arc::new(SubscriptionRegistry::new()), settings);

        assert_eq!(scheduler.settings().delivery_timeout, Duration::from_millis(500));
        assert_eq!(scheduler.settings().failure_threshold, 1);
    }

    #[tokio::test]
    async fn test_unregistered_subscriber_gets_nothing() {
        let mut store = MockStore::new();
        store.expect_aggregate().times(0);
        let mut sink = MockSink::new();
        sink.expect_send().times(0);

        let scheduler = scheduler(query_service(Arc::new(store), Duration::from_secs(5)), 3);
        let subscriber = scheduler.registry().register(Arc::new(sink)).await;
        scheduler.registry().unregister(subscriber.id()).await;

        assert_eq!(scheduler.connected_count().await, 0);
        assert_eq!(scheduler.tick().await, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_the_same_update() {
        let scheduler = scheduler(query_service(seeded_store().await, Duration::from_secs(5)), 3);
        let (_a, mut rx_a) = scheduler.registry().register_channel(8).await;
        let (_b, mut rx_b) = scheduler.registry().register_channel(8).await;

        match scheduler.tick().await {
            TickOutcome::Broadcast { updates, report } => {
                assert_eq!(updates, 2);
                assert_eq!(report.delivered, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        for _ in 0..2 {
            let a = rx_a.recv().await.unwrap();
            let b = rx_b.recv().await.unwrap();
            assert!(Arc::ptr_eq(&a, &b));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_is_evicted() {
        let scheduler = scheduler(query_service(seeded_store().await, Duration::from_secs(5)), 2);
        let stalled = scheduler.registry().register(Arc::new(StalledSink)).await;
        let (_healthy, mut rx) = scheduler.registry().register_channel(16).await;

        match scheduler.tick().await {
            TickOutcome::Broadcast { report, .. } => {
                assert_eq!(report.delivered, 1);
                assert_eq!(report.failed, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(stalled.consecutive_failures(), 1);

        match scheduler.tick().await {
            TickOutcome::Broadcast { report, .. } => assert_eq!(report.evicted, 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(scheduler.registry().get(stalled.id()).await.is_none());

        scheduler.tick().await;
        assert_eq!(scheduler.connected_count().await, 1);

        let mut received = Vec::new();
        while let Ok(update) = rx.try_recv() {
            received.push(update.name());
        }
        assert_eq!(received.len(), 6);
        assert_eq!(received[0], "dashboardUpdate");
        assert_eq!(received[1], "metricsUpdate");
    }

    #[tokio::test]
    async fn test_closed_sink_failures_stay_isolated() {
        let mut sink = MockSink::new();
        sink.expect_send()
            .times(1)
            .returning(|_| Err(SinkClosed));

        let scheduler = scheduler(query_service(seeded_store().await, Duration::from_secs(5)), 1);
        let broken = scheduler.registry().register(Arc::new(sink)).await;
        let (_ok, mut rx) = scheduler.registry().register_channel(8).await;

        match scheduler.tick().await {
            TickOutcome::Broadcast { report, .. } => {
                assert_eq!(report.delivered, 1);
                assert_eq!(report.evicted, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(scheduler.registry().get(broken.id()).await.is_none());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_tick_survives_store_failure() {
        let mut store = MockStore::new();
        store.expect_aggregate()
            .returning(|_, _| Err(StoreError::Query("boom".to_string())));

        let scheduler = scheduler(query_service(Arc::new(store), Duration::from_secs(5)), 3);
        let (_subscriber, mut rx) = scheduler.registry().register_channel(4).await;

        match scheduler.tick().await {
            TickOutcome::Broadcast { updates, .. } => assert_eq!(updates, 0),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.state().await, SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_connect_pushes_dashboard_immediately() {
        let scheduler = scheduler(query_service(seeded_store().await, Duration::from_secs(5)), 3);
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Arc<Update>>(4);

        let subscriber = scheduler.on_connect(Arc::new(tx)).await;
        assert_eq!(scheduler.connected_count().await, 1);

        let update = rx.recv().await.unwrap();
        match update.as_ref() {
            Update::DashboardUpdate(dashboard) => {
                assert_eq!(dashboard.user_activity.results[0].key(), &GroupingValue::from("purchase"));
                assert_eq!(dashboard.sales.results[0].sum(), 150.0);
            }
            other => panic!("unexpected update {:?}", other),
        }

        scheduler.on_disconnect(subscriber.id()).await;
        assert_eq!(scheduler.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_connect_with_store_down_sends_error() {
        let mut store = MockStore::new();
        store.expect_aggregate()
            .returning(|_, _| Err(StoreError::Connection("refused".to_string())));

        let scheduler = scheduler(query_service(Arc::new(store), Duration::from_secs(5)), 3);
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Arc<Update>>(4);
        scheduler.on_connect(Arc::new(tx)).await;

        match rx.recv().await.unwrap().as_ref() {
            Update::Error { message } => assert_eq!(message, "Failed to fetch dashboard data"),
            other => panic!("unexpected update {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_on_demand_refresh_targets_requester_only() {
        let scheduler = scheduler(query_service(seeded_store().await, Duration::from_secs(5)), 3);
        let (tx_a, mut rx_a) = tokio::sync::mpsc::channel::<Arc<Update>>(4);
        let (tx_b, mut rx_b) = tokio::sync::mpsc::channel::<Arc<Update>>(4);
        let a = scheduler.on_connect(Arc::new(tx_a)).await;
        scheduler.on_connect(Arc::new(tx_b)).await;
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        assert_eq!(scheduler.on_demand_refresh(a.id()).await, Some(Delivery::Delivered));
        assert_eq!(rx_a.recv().await.unwrap().name(), "dashboardUpdate");

        assert_eq!(scheduler.on_demand_metrics(a.id()).await, Some(Delivery::Delivered));
        assert_eq!(rx_a.recv().await.unwrap().name(), "metricsUpdate");

        assert!(rx_b.try_recv().is_err());
        assert_eq!(scheduler.on_demand_refresh(crate::registry::SubscriberId::new()).await, None);
    }

    #[tokio::test]
    async fn test_published_records_reach_all_subscribers() {
        let scheduler = scheduler(query_service(Arc::new(InMemoryEventStore::new()), Duration::from_secs(5)), 3);
        let (_a, mut rx_a) = scheduler.registry().register_channel(4).await;
        let (_b, mut rx_b) = scheduler.registry().register_channel(4).await;

        let report = scheduler.publish_event(sale(12.5, chrono::Duration::zero())).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap().name(), "salesDataUpdate");
        assert_eq!(rx_b.recv().await.unwrap().name(), "salesDataUpdate");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ticks_on_cadence_and_stops() {
        let scheduler = scheduler(query_service(seeded_store().await, Duration::from_secs(5)), 3);
        let (_subscriber, mut rx) = scheduler.registry().register_channel(16).await;

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(450)).await;
        scheduler.shutdown().await;

        assert_eq!(scheduler.state().await, SchedulerState::Stopped);
        assert_eq!(scheduler.tick().await, TickOutcome::Stopped);

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
    }
}
