//! Pulsewire demo runtime.
//!
//! Seeds an in-memory event store with synthetic activity and sales records,
//! keeps appending new records to simulate live ingestion, and attaches a
//! console subscriber that logs every pushed update as JSON.
//!
//! ```text
//! Options:
//!   -c, --config <FILE>                   Path to a TOML configuration file
//!       --tick-interval-ms <MS>           Broadcast cadence [env: PULSEWIRE_TICK_INTERVAL_MS]
//!       --delivery-timeout-ms <MS>        Delivery timeout [env: PULSEWIRE_DELIVERY_TIMEOUT_MS]
//!       --seed-events <N>                 Synthetic records to seed [default: 150]
//! ```
//!
//! Set `RUST_LOG=pulsewire=debug` for per-tick logging.

use async_stream::stream;
use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use futures::stream::{BoxStream, StreamExt};
use pulsewire::{
    AggregationEngine, BroadcastScheduler, CliArgs, Event, InMemoryEventStore, QueryService, Sale,
    Settings, SnapshotCache, SubscriptionRegistry, Update, UserActivity,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ACTIONS: [&str; 8] = [
    "login",
    "logout",
    "page_view",
    "click",
    "search",
    "purchase",
    "signup",
    "profile_update",
];
const PAGES: [&str; 8] = [
    "/dashboard",
    "/products",
    "/analytics",
    "/profile",
    "/settings",
    "/help",
    "/checkout",
    "/catalog",
];
const PRODUCTS: [(&str, &str, f64); 5] = [
    ("Laptop Pro", "Electronics", 1299.0),
    ("Wireless Mouse", "Electronics", 29.0),
    ("Office Chair", "Furniture", 249.0),
    ("Notebook Set", "Stationery", 12.0),
    ("Coffee Maker", "Appliances", 89.0),
];
const REGIONS: [&str; 6] = [
    "North America",
    "Europe",
    "Asia Pacific",
    "Latin America",
    "Middle East",
    "Africa",
];

/// Deterministic synthetic record `n`; every third one is a sale.
fn synthetic_event(n: usize, age: chrono::Duration) -> Event {
    let timestamp = Utc::now() - age;
    if n % 3 == 2 {
        let (name, category, price) = PRODUCTS[n % PRODUCTS.len()];
        let quantity = (n % 4 + 1) as u32;
        Event::from(Sale {
            product_id: format!("prod-{}", n % PRODUCTS.len()),
            product_name: name.to_string(),
            customer_id: format!("cust-{}", n % 40),
            amount: price * quantity as f64,
            quantity,
            category: Some(category.to_string()),
            region: Some(REGIONS[n % REGIONS.len()].to_string()),
            sales_rep: Some(format!("rep-{}", n % 7)),
            timestamp,
        })
    } else {
        Event::from(UserActivity {
            user_id: format!("user-{}", n % 25),
            action: Some(ACTIONS[n % ACTIONS.len()].to_string()),
            page: Some(PAGES[(n / 2) % PAGES.len()].to_string()),
            duration: Some((n % 300) as f64),
            timestamp,
        })
    }
}

/// Endless stream of new records, one per `every`.
fn live_events(start: usize, every: Duration) -> BoxStream<'static, Event> {
    Box::pin(stream! {
        let mut ticker = tokio::time::interval(every);
        let mut n = start;
        loop {
            ticker.tick().await;
            yield synthetic_event(n, chrono::Duration::zero());
            n += 1;
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = CliArgs::parse();
    let settings = Settings::from_cli(&cli)?;
    let seed_events = cli.seed_events;

    let store = Arc::new(InMemoryEventStore::new());
    store
        .extend((0..seed_events).map(|n| {
            synthetic_event(n, chrono::Duration::minutes((n % (48 * 60)) as i64))
        }))
        .await;
    info!(events = store.len().await, "seeded event store");

    let engine = AggregationEngine::new(store.clone(), settings.store_timeout());
    let cache = Arc::new(SnapshotCache::new(settings.snapshot_staleness(), settings.stale_grace()));
    let query = Arc::new(QueryService::new(engine, cache.clone(), settings.query_windows()));
    let registry = Arc::new(SubscriptionRegistry::new());
    let scheduler = Arc::new(BroadcastScheduler::new(query.clone(), registry, settings.broadcast()));

    let summary = query.sales_summary().await?;
    info!(
        total_sales = summary.total_sales,
        transactions = summary.total_transactions,
        "sales summary"
    );

    scheduler.start().await;

    let (tx, rx) = tokio::sync::mpsc::channel::<Arc<Update>>(settings.subscriber_buffer.max(1));
    let console = scheduler.on_connect(Arc::new(tx)).await;
    let console_id = console.id();
    let printer = tokio::spawn(async move {
        let mut updates = ReceiverStream::new(rx);
        while let Some(update) = updates.next().await {
            match serde_json::to_string(update.as_ref()) {
                Ok(json) => info!(subscriber = %console_id, event = update.name(), "{}", json),
                Err(e) => warn!(error = %e, "failed to encode update"),
            }
        }
    });

    let ingest = {
        let store = store.clone();
        let scheduler = scheduler.clone();
        let cache = cache.clone();
        let retention = settings.stale_grace();
        tokio::spawn(async move {
            let mut events = live_events(seed_events, Duration::from_millis(750));
            while let Some(event) = events.next().await {
                store.append(event.clone()).await;
                scheduler.publish_event(event).await;
                cache.invalidate_older_than(retention).await;
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    ingest.abort();
    scheduler.on_disconnect(console_id).await;
    scheduler.shutdown().await;
    printer.abort();

    Ok(())
}
