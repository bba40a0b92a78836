use crate::registry::SubscriberId;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the aggregation and broadcast core.
///
/// Cloneable so one failed refresh can be handed to every requester that
/// coalesced onto it.
#[derive(Debug, Clone, Error)]
pub enum AnalyticsError {
    /// The event store failed or did not answer within the store timeout.
    #[error("event store temporarily unavailable: {0}")]
    StoreUnavailable(String),

    /// Caller supplied a window that cannot be aggregated.
    #[error("invalid window spec: {0}")]
    InvalidWindowSpec(String),

    /// A single subscriber could not take an update.
    #[error("delivery to subscriber {subscriber} failed: {reason}")]
    DeliveryFailure {
        subscriber: SubscriberId,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(#[source] Arc<config::ConfigError>),
}

impl From<config::ConfigError> for AnalyticsError {
    fn from(err: config::ConfigError) -> Self {
        AnalyticsError::Config(Arc::new(err))
    }
}

impl AnalyticsError {
    /// Only store outages are worth another attempt; everything else is a
    /// caller or subscriber problem.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalyticsError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
