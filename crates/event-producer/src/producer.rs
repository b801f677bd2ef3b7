//! Publishing with retry and partition selection.

use std::sync::Arc;

use broker_client::{Broker, BrokerError, Record, RetryPolicy};
use event_types::{Envelope, CONTENT_TYPE_CLOUDEVENTS_JSON};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PublishError;
use crate::partition::{partition_for_key, RoundRobin};

/// CloudEvents extension attribute naming the partitioning key.
pub const PARTITION_KEY_EXTENSION: &str = "partitionkey";

/// Broker acknowledgment of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: i32,
    pub offset: i64,
}

/// Publishes envelopes to a topic through the broker seam.
///
/// Safe to share across tasks: all methods take `&self` and the only internal
/// state is the round-robin cursor.
pub struct Producer {
    broker: Arc<dyn Broker>,
    retry: RetryPolicy,
    round_robin: RoundRobin,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, retry: RetryPolicy) -> Self {
        Self {
            broker,
            retry,
            round_robin: RoundRobin::default(),
        }
    }

    /// Publish an envelope, retrying transient broker failures with backoff.
    ///
    /// The partition is chosen by hashing the `partitionkey` extension when
    /// present, round-robin otherwise. On success the returned [`Ack`]
    /// carries the assigned partition and offset.
    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<Ack, PublishError> {
        self.publish_with_cancel(topic, envelope, &CancellationToken::new())
            .await
    }

    /// Like [`publish`](Self::publish), but abortable: cancelling the token
    /// aborts the in-flight attempt (or the backoff sleep) and surfaces
    /// [`PublishError::Cancelled`] without corrupting connection state.
    pub async fn publish_with_cancel(
        &self,
        topic: &str,
        envelope: &Envelope,
        cancel: &CancellationToken,
    ) -> Result<Ack, PublishError> {
        let payload = envelope.to_bytes()?;

        let mut attempt = 0u32;
        let last_error: BrokerError;
        loop {
            if cancel.is_cancelled() {
                return Err(PublishError::Cancelled);
            }
            attempt += 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(PublishError::Cancelled),
                outcome = self.try_publish(topic, envelope, &payload) => outcome,
            };
            match outcome {
                Ok(ack) => {
                    debug!(
                        topic,
                        partition = ack.partition,
                        offset = ack.offset,
                        id = %envelope.id,
                        "published event"
                    );
                    return Ok(ack);
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt - 1);
                    warn!(topic, attempt, ?delay, "transient publish failure: {err}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PublishError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) if err.is_transient() => {
                    last_error = err;
                    break;
                }
                Err(err) => return Err(PublishError::Rejected(err.to_string())),
            }
        }

        Err(match last_error {
            BrokerError::Timeout(timeout) => PublishError::Timeout(format!(
                "no acknowledgment within {timeout:?} after {attempt} attempts"
            )),
            other => PublishError::Unavailable {
                attempts: attempt,
                message: other.to_string(),
            },
        })
    }

    async fn try_publish(
        &self,
        topic: &str,
        envelope: &Envelope,
        payload: &[u8],
    ) -> Result<Ack, BrokerError> {
        let partitions = self.broker.partition_count(topic).await?;
        let key = envelope.extension_str(PARTITION_KEY_EXTENSION);
        let partition = match key {
            Some(key) => partition_for_key(key.as_bytes(), partitions),
            None => self.round_robin.next(partitions),
        };

        let mut record = Record::new(payload.to_vec())
            .with_header("content-type", CONTENT_TYPE_CLOUDEVENTS_JSON);
        if let Some(key) = key {
            record = record.with_key(key.as_bytes().to_vec());
        }

        let offset = self.broker.append(topic, partition, record).await?;
        Ok(Ack { partition, offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_client::{GroupMembership, MemoryBroker, Result as BrokerResult};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn envelope(id: &str, key: Option<&str>) -> Envelope {
        let mut builder = Envelope::builder()
            .id(id)
            .source("https://cloudstream/producer")
            .event_type("io.cloudstream.producer");
        if let Some(key) = key {
            builder = builder.extension(PARTITION_KEY_EXTENSION, key);
        }
        builder.build().unwrap()
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            2.0,
            Duration::from_millis(10),
        )
    }

    /// Broker that fails the first `failures` appends with a transient error.
    struct FlakyBroker {
        inner: MemoryBroker,
        failures: AtomicU32,
        attempts: AtomicU32,
    }

    impl FlakyBroker {
        fn new(inner: MemoryBroker, failures: u32) -> Self {
            Self {
                inner,
                failures: AtomicU32::new(failures),
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn ensure_topic(&self, topic: &str, partitions: i32) -> BrokerResult<()> {
            self.inner.ensure_topic(topic, partitions).await
        }

        async fn partition_count(&self, topic: &str) -> BrokerResult<i32> {
            self.inner.partition_count(topic).await
        }

        async fn append(&self, topic: &str, partition: i32, record: Record) -> BrokerResult<i64> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BrokerError::Unavailable("connection refused".to_string()));
            }
            self.inner.append(topic, partition, record).await
        }

        async fn join_group(
            &self,
            group: &str,
            topics: &[String],
        ) -> BrokerResult<Box<dyn GroupMembership>> {
            self.inner.join_group(group, topics).await
        }

        async fn close(&self) -> BrokerResult<()> {
            self.inner.close().await
        }
    }

    async fn seeded_memory(topic: &str, partitions: i32) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.ensure_topic(topic, partitions).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_returns_partition_and_offset() {
        let broker = Arc::new(seeded_memory("events", 1).await);
        let producer = Producer::new(broker, fast_policy(3));

        let ack = producer.publish("events", &envelope("e1", None)).await.unwrap();
        assert_eq!(ack, Ack { partition: 0, offset: 0 });
        let ack = producer.publish("events", &envelope("e2", None)).await.unwrap();
        assert_eq!(ack.offset, 1);
    }

    #[tokio::test]
    async fn test_keyed_events_land_on_a_stable_partition() {
        let broker = Arc::new(seeded_memory("events", 8).await);
        let producer = Producer::new(broker, fast_policy(3));

        let first = producer
            .publish("events", &envelope("e1", Some("user_001")))
            .await
            .unwrap();
        let second = producer
            .publish("events", &envelope("e2", Some("user_001")))
            .await
            .unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let memory = seeded_memory("events", 1).await;
        let flaky = Arc::new(FlakyBroker::new(memory, 2));
        let producer = Producer::new(Arc::clone(&flaky) as Arc<dyn Broker>, fast_policy(5));

        let ack = producer.publish("events", &envelope("e1", None)).await.unwrap();
        assert_eq!(ack.offset, 0);
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_unavailable() {
        let memory = seeded_memory("events", 1).await;
        let flaky = Arc::new(FlakyBroker::new(memory, u32::MAX));
        let producer = Producer::new(Arc::clone(&flaky) as Arc<dyn Broker>, fast_policy(4));

        let err = producer.publish("events", &envelope("e1", None)).await.unwrap_err();
        match err {
            PublishError::Unavailable { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected Unavailable, got {other:?}"),
        }
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let broker = Arc::new(MemoryBroker::new());
        let producer = Producer::new(broker, fast_policy(5));

        // Topic was never created: the broker rejects outright.
        let err = producer.publish("missing", &envelope("e1", None)).await.unwrap_err();
        assert!(matches!(err, PublishError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_publish() {
        let broker = Arc::new(seeded_memory("events", 1).await);
        let producer = Producer::new(broker, fast_policy(3));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = producer
            .publish_with_cancel("events", &envelope("e1", None), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Cancelled));
    }

    #[tokio::test]
    async fn test_round_robin_spreads_unkeyed_events() {
        let broker = Arc::new(seeded_memory("events", 3).await);
        let producer = Producer::new(broker, fast_policy(3));

        let mut partitions = Vec::new();
        for i in 0..3 {
            let ack = producer
                .publish("events", &envelope(&format!("e{i}"), None))
                .await
                .unwrap();
            partitions.push(ack.partition);
        }
        partitions.sort_unstable();
        assert_eq!(partitions, vec![0, 1, 2]);
    }
}
