//! Dead-letter sink.
//!
//! Permanently failing records are appended to a dedicated topic with the
//! original payload untouched, plus headers describing the failure and where
//! the record came from. The sink keeps poison messages from blocking the
//! main pipeline.

use std::sync::Arc;

use broker_client::{Broker, FetchedRecord, Record};
use tracing::info;

use crate::error::ConsumerError;

/// Header names attached to dead-lettered records.
pub mod headers {
    pub const ERROR: &str = "dlq.error";
    pub const SOURCE_TOPIC: &str = "dlq.topic";
    pub const SOURCE_PARTITION: &str = "dlq.partition";
    pub const SOURCE_OFFSET: &str = "dlq.offset";
}

/// Routes permanently failed records to a dead-letter topic.
pub struct DeadLetterSink {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl DeadLetterSink {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Create the dead-letter topic if it does not exist.
    pub async fn ensure(&self) -> Result<(), ConsumerError> {
        self.broker.ensure_topic(&self.topic, 1).await?;
        Ok(())
    }

    /// Append a failed record to the dead-letter topic.
    ///
    /// Failing to route is an error the caller must not swallow: the source
    /// offset stays uncommitted so the record is redelivered rather than
    /// lost.
    pub async fn route(&self, record: &FetchedRecord, reason: &str) -> Result<(), ConsumerError> {
        let mut dead = Record::new(record.payload.clone())
            .with_header(headers::ERROR, reason)
            .with_header(headers::SOURCE_TOPIC, &record.topic)
            .with_header(headers::SOURCE_PARTITION, record.partition.to_string())
            .with_header(headers::SOURCE_OFFSET, record.offset.to_string());
        if let Some(key) = &record.key {
            dead = dead.with_key(key.clone());
        }

        self.broker
            .append(&self.topic, 0, dead)
            .await
            .map_err(|e| ConsumerError::DeadLetter(e.to_string()))?;
        info!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            reason,
            "record routed to dead-letter topic"
        );
        Ok(())
    }
}
