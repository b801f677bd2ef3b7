//! Event publishing for cloudstream.
//!
//! [`Producer`] serializes CloudEvents envelopes and appends them to the
//! broker, choosing the partition by key hash (the `partitionkey` extension)
//! or round-robin, and retrying transient broker failures under the shared
//! backoff policy. [`EventWriter`] sits on top of it and turns domain records
//! into envelopes the way the original event supplier does: UUID id,
//! configured source and type, monotonic non-decreasing timestamp, and the
//! payload serialized as JSON.

pub mod error;
pub mod partition;
pub mod producer;
pub mod writer;

pub use error::PublishError;
pub use producer::{Ack, Producer, PARTITION_KEY_EXTENSION};
pub use writer::EventWriter;
