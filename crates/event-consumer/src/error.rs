//! Error types for the consumer side.

use broker_client::BrokerError;
use thiserror::Error;

/// Error returned by an event handler.
///
/// Handler failures are retried up to the configured budget, then the record
/// is dead-lettered and processing continues.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced by [`Consumer::run`](crate::Consumer::run).
///
/// Rebalance and transient broker failures are handled inside the loop;
/// what escapes here ends the member for good (e.g. the broker client was
/// closed underneath it).
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to join group '{group}': {message}")]
    Rebalance { group: String, message: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("dead-letter routing failed: {0}")]
    DeadLetter(String),
}
