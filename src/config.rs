//! Runtime settings.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/default.toml` and `config/local.toml` (both optional)
//! 3. A file passed with `--config`
//! 4. Environment variables prefixed `PULSEWIRE__`, e.g.
//!    `PULSEWIRE__TICK_INTERVAL_MS=2000` or `PULSEWIRE__WINDOWS__METRICS_SECS=600`
//! 5. Command-line arguments

use crate::query::QueryWindows;
use crate::scheduler::BroadcastSettings;
use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments for the runtime binary.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Broadcast cadence in milliseconds
    #[arg(long, env = "PULSEWIRE_TICK_INTERVAL_MS")]
    pub tick_interval_ms: Option<u64>,

    /// Per-subscriber delivery timeout in milliseconds
    #[arg(long, env = "PULSEWIRE_DELIVERY_TIMEOUT_MS")]
    pub delivery_timeout_ms: Option<u64>,

    /// Number of synthetic events to seed the in-memory store with
    #[arg(long, default_value_t = 150)]
    pub seed_events: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub tick_interval_ms: u64,
    /// Defaults to the tick interval when unset
    #[serde(default)]
    pub snapshot_staleness_ms: Option<u64>,
    pub delivery_timeout_ms: u64,
    pub store_timeout_ms: u64,
    /// Consecutive failed deliveries before a subscriber is evicted
    pub failure_threshold: u32,
    pub shutdown_grace_ms: u64,
    /// How old a snapshot may be and still be served while the store is down
    pub stale_grace_ms: u64,
    pub subscriber_buffer: usize,
    pub windows: WindowSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowSettings {
    pub dashboard_secs: u64,
    pub metrics_secs: u64,
    pub aggregate_secs: u64,
    pub history_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5000,
            snapshot_staleness_ms: None,
            delivery_timeout_ms: 1000,
            store_timeout_ms: 2000,
            failure_threshold: 3,
            shutdown_grace_ms: 2000,
            stale_grace_ms: 60_000,
            subscriber_buffer: 16,
            windows: WindowSettings::default(),
        }
    }
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            dashboard_secs: 86_400,
            metrics_secs: 3_600,
            aggregate_secs: 3_600,
            history_secs: 31_536_000,
        }
    }
}

impl Settings {
    /// Loads settings from the `config/` directory and the environment.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Loads settings, additionally reading `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let config_dir = Path::new("config");

        let mut builder = Config::builder()
            .set_default("tick_interval_ms", defaults.tick_interval_ms as i64)?
            .set_default("delivery_timeout_ms", defaults.delivery_timeout_ms as i64)?
            .set_default("store_timeout_ms", defaults.store_timeout_ms as i64)?
            .set_default("failure_threshold", defaults.failure_threshold as i64)?
            .set_default("shutdown_grace_ms", defaults.shutdown_grace_ms as i64)?
            .set_default("stale_grace_ms", defaults.stale_grace_ms as i64)?
            .set_default("subscriber_buffer", defaults.subscriber_buffer as i64)?
            .set_default("windows.dashboard_secs", defaults.windows.dashboard_secs as i64)?
            .set_default("windows.metrics_secs", defaults.windows.metrics_secs as i64)?
            .set_default("windows.aggregate_secs", defaults.windows.aggregate_secs as i64)?
            .set_default("windows.history_secs", defaults.windows.history_secs as i64)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join("local.toml")).required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder
            .add_source(
                Environment::with_prefix("PULSEWIRE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Loads settings and applies command-line overrides.
    pub fn from_cli(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut settings = Self::load(cli.config.as_deref())?;
        if let Some(tick) = cli.tick_interval_ms {
            settings.tick_interval_ms = tick;
        }
        if let Some(timeout) = cli.delivery_timeout_ms {
            settings.delivery_timeout_ms = timeout;
        }
        Ok(settings)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn snapshot_staleness(&self) -> Duration {
        self.snapshot_staleness_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.tick_interval())
    }

    /// Delivery timeout, capped at half the tick interval.
    pub fn delivery_timeout(&self) -> Duration {
        self.broadcast().delivery_timeout
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn stale_grace(&self) -> Duration {
        Duration::from_millis(self.stale_grace_ms)
    }

    pub fn broadcast(&self) -> BroadcastSettings {
        BroadcastSettings {
            tick_interval: self.tick_interval(),
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            failure_threshold: self.failure_threshold,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
        .clamped()
    }

    pub fn query_windows(&self) -> QueryWindows {
        QueryWindows {
            dashboard: Duration::from_secs(self.windows.dashboard_secs),
            metrics: Duration::from_secs(self.windows.metrics_secs),
            aggregate: Duration::from_secs(self.windows.aggregate_secs),
            history: Duration::from_secs(self.windows.history_secs),
        }
    }
}
