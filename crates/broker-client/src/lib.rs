//! Broker client abstraction for cloudstream.
//!
//! This crate owns everything that touches the log broker:
//!
//! - [`Broker`] / [`GroupMembership`] - the seam between the pipeline and the
//!   underlying broker. Producers append through it, consumers poll and
//!   commit through it, and neither ever holds a raw connection.
//! - [`KafkaBroker`] - production backend over librdkafka. Topic creation,
//!   partition-leader discovery, consumer-group rebalancing and reconnection
//!   are delegated to the Kafka client library.
//! - [`MemoryBroker`] - in-process backend with the same observable
//!   semantics (partitioned append-only logs, group coordination with
//!   rebalance generations, committed offsets). Used by tests and the
//!   self-contained `pipeline` demo.
//! - [`RetryPolicy`] - pure backoff policy consumed by the producer, the
//!   consumer and the startup probe.
//!
//! A broker client is constructed once at startup and injected into the
//! producer and consumer; it owns its connections and is closed explicitly.

pub mod error;
pub mod kafka;
pub mod memory;
pub mod record;
pub mod retry;

use std::time::Duration;

use async_trait::async_trait;

pub use error::{BrokerError, Result};
pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;
pub use record::{FetchedRecord, Record, TopicPartition};
pub use retry::RetryPolicy;

/// Connection-owning handle to a log broker.
///
/// Implementations are internally synchronized: all methods take `&self` and
/// are safe to call concurrently from any task.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a topic with the given partition count if it does not exist.
    ///
    /// An already existing topic is not an error; its partition count is left
    /// untouched.
    async fn ensure_topic(&self, topic: &str, partitions: i32) -> Result<()>;

    /// Number of partitions of an existing topic.
    async fn partition_count(&self, topic: &str) -> Result<i32>;

    /// Append a record to one partition of a topic, returning the assigned
    /// offset.
    async fn append(&self, topic: &str, partition: i32, record: Record) -> Result<i64>;

    /// Join a consumer group subscribed to the given topics.
    ///
    /// Each call creates one group member with its own poll position;
    /// partition ownership is (re)assigned by the broker's group coordination
    /// whenever members join or leave.
    async fn join_group(&self, group: &str, topics: &[String]) -> Result<Box<dyn GroupMembership>>;

    /// Release the broker's connections. Further operations fail with
    /// [`BrokerError::Closed`].
    async fn close(&self) -> Result<()>;
}

/// One member of a consumer group.
///
/// Dropping a membership without calling [`leave`](Self::leave) is treated as
/// a member crash: uncommitted progress is lost and the next poll of the
/// remaining members sees the partitions reassigned.
#[async_trait]
pub trait GroupMembership: Send {
    /// Fetch the next batch of records from the partitions currently
    /// assigned to this member.
    ///
    /// Blocks up to `timeout` waiting for records; an empty batch means the
    /// timeout elapsed. Within a partition, records are delivered in append
    /// order, starting from the committed offset at (re)join time.
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<FetchedRecord>>;

    /// Commit the next offset to read for a partition.
    ///
    /// `next_offset` is one past the last processed record, matching the
    /// broker's committed-offset convention. Commits for partitions this
    /// member no longer owns fail with [`BrokerError::StaleMember`].
    async fn commit(&mut self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;

    /// Partitions currently assigned to this member.
    async fn assignment(&mut self) -> Result<Vec<TopicPartition>>;

    /// Leave the group, triggering a rebalance for the remaining members.
    async fn leave(&mut self) -> Result<()>;
}
