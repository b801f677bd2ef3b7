//! Error types for broker operations.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`Broker`](crate::Broker) and
/// [`GroupMembership`](crate::GroupMembership) operations.
///
/// `Unavailable` and `Timeout` are transient: callers retry them under a
/// [`RetryPolicy`](crate::RetryPolicy). The rest are terminal for the
/// operation that hit them.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("unknown partition {partition} for topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },

    #[error("group member lost its assignment in a rebalance")]
    StaleMember,

    #[error("broker client is closed")]
    Closed,
}

impl BrokerError {
    /// Whether retrying the operation can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Timeout(_))
    }
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
