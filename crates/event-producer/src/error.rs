//! Error types for publishing.

use event_types::{BuilderError, EncodeError};
use thiserror::Error;

/// Errors surfaced by [`Producer::publish`](crate::Producer::publish).
///
/// `Unavailable` means the retry budget ran out against a broker that kept
/// failing transiently; `Rejected` means the broker answered and said no, so
/// retrying cannot help and the error is surfaced immediately.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("broker unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("publish timed out: {0}")]
    Timeout(String),

    #[error("broker rejected the record: {0}")]
    Rejected(String),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] EncodeError),

    #[error("failed to build envelope: {0}")]
    Build(#[from] BuilderError),

    #[error("publish cancelled")]
    Cancelled,
}
