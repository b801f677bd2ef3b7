//! Kafka broker backend over librdkafka.
//!
//! The broker protocol itself (partition leadership, consumer-group
//! coordination, reconnection) is the client library's job; this module maps
//! it onto the [`Broker`]/[`GroupMembership`] seam and translates errors into
//! the pipeline's taxonomy. Offsets are committed manually
//! (`enable.auto.commit=false`) so the consumer controls exactly when a
//! record counts as processed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, warn};

use crate::record::{FetchedRecord, Record, TopicPartition};
use crate::{Broker, BrokerError, GroupMembership, Result};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(5);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka-backed [`Broker`].
///
/// Owns one shared producer connection pool (librdkafka multiplexes it across
/// callers); consumers get their own connection per group membership.
pub struct KafkaBroker {
    bootstrap: String,
    session_timeout_ms: String,
    send_timeout: Duration,
    producer: FutureProducer,
    closed: AtomicBool,
}

impl KafkaBroker {
    /// Create a client for the given bootstrap servers.
    ///
    /// Connection establishment is lazy; use
    /// [`ensure_topic`](Broker::ensure_topic) or
    /// [`partition_count`](Broker::partition_count) as a reachability probe.
    pub fn connect(bootstrap: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        Ok(Self {
            bootstrap: bootstrap.to_string(),
            session_timeout_ms: "30000".to_string(),
            send_timeout: Duration::from_secs(5),
            producer,
            closed: AtomicBool::new(false),
        })
    }

    /// Override the consumer session timeout (milliseconds).
    pub fn with_session_timeout_ms(mut self, session_timeout_ms: impl Into<String>) -> Self {
        self.session_timeout_ms = session_timeout_ms.into();
        self
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

/// Map a Kafka client error into the pipeline taxonomy.
fn classify(err: KafkaError, timeout: Duration) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::UnknownTopic) | Some(RDKafkaErrorCode::UnknownTopicOrPartition) => {
            BrokerError::UnknownTopic(err.to_string())
        }
        Some(RDKafkaErrorCode::MessageTimedOut)
        | Some(RDKafkaErrorCode::OperationTimedOut)
        | Some(RDKafkaErrorCode::RequestTimedOut) => BrokerError::Timeout(timeout),
        _ => BrokerError::Unavailable(err.to_string()),
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn ensure_topic(&self, topic: &str, partitions: i32) -> Result<()> {
        self.check_open()?;
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap)
            .create()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(1));
        let opts = AdminOptions::new().operation_timeout(Some(ADMIN_TIMEOUT));

        let results = admin
            .create_topics(&[new_topic], &opts)
            .await
            .map_err(|e| classify(e, ADMIN_TIMEOUT))?;
        for result in results {
            match result {
                Ok(name) => debug!("Topic '{name}' created"),
                Err((name, code)) => {
                    if code == RDKafkaErrorCode::TopicAlreadyExists {
                        debug!("Topic '{name}' already exists");
                    } else {
                        return Err(BrokerError::Unavailable(format!(
                            "failed to create topic '{name}': {code}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> Result<i32> {
        self.check_open()?;
        let producer = self.producer.clone();
        let topic_name = topic.to_string();
        // Metadata fetches block, so they run off the async executor.
        tokio::task::spawn_blocking(move || {
            let metadata = producer
                .client()
                .fetch_metadata(Some(&topic_name), METADATA_TIMEOUT)
                .map_err(|e| classify(e, METADATA_TIMEOUT))?;
            let partitions = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic_name)
                .map(|t| t.partitions().len())
                .unwrap_or(0);
            if partitions == 0 {
                return Err(BrokerError::UnknownTopic(topic_name));
            }
            Ok(partitions as i32)
        })
        .await
        .map_err(|e| BrokerError::Unavailable(e.to_string()))?
    }

    async fn append(&self, topic: &str, partition: i32, record: Record) -> Result<i64> {
        self.check_open()?;
        let mut headers = OwnedHeaders::new();
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_bytes()),
            });
        }

        let mut kafka_record = FutureRecord::<Vec<u8>, Vec<u8>>::to(topic)
            .partition(partition)
            .payload(&record.payload)
            .headers(headers);
        if let Some(key) = &record.key {
            kafka_record = kafka_record.key(key);
        }

        let (delivered_partition, offset) = self
            .producer
            .send(kafka_record, self.send_timeout)
            .await
            .map_err(|(err, _)| classify(err, self.send_timeout))?;
        debug!(topic, partition = delivered_partition, offset, "record appended");
        Ok(offset)
    }

    async fn join_group(&self, group: &str, topics: &[String]) -> Result<Box<dyn GroupMembership>> {
        self.check_open()?;
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", &self.session_timeout_ms)
            .create()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| classify(e, Duration::ZERO))?;
        debug!(group, ?topics, "joined consumer group");

        Ok(Box::new(KafkaMembership { consumer }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.producer
            .flush(self.send_timeout)
            .map_err(|e| classify(e, self.send_timeout))
    }
}

/// One consumer-group member backed by a Kafka stream consumer.
pub struct KafkaMembership {
    consumer: StreamConsumer,
}

/// Once a first record arrives, keep draining for at most this long so small
/// batches are not held back until the full poll timeout.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

#[async_trait]
impl GroupMembership for KafkaMembership {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<FetchedRecord>> {
        let deadline = Instant::now() + timeout;
        let mut batch: Vec<FetchedRecord> = Vec::new();

        while batch.len() < max_records {
            let until_deadline = deadline.saturating_duration_since(Instant::now());
            if until_deadline.is_zero() {
                break;
            }
            let wait = if batch.is_empty() {
                until_deadline
            } else {
                DRAIN_TIMEOUT.min(until_deadline)
            };
            match tokio::time::timeout(wait, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => {
                    let headers = message
                        .headers()
                        .map(|headers| {
                            headers
                                .iter()
                                .map(|header| {
                                    (
                                        header.key.to_string(),
                                        header
                                            .value
                                            .map(|v| String::from_utf8_lossy(v).into_owned())
                                            .unwrap_or_default(),
                                    )
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    batch.push(FetchedRecord {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message.key().map(|k| k.to_vec()),
                        payload: message.payload().unwrap_or_default().to_vec(),
                        headers,
                        timestamp: message.timestamp().to_millis(),
                    });
                }
                Ok(Err(err)) => {
                    if batch.is_empty() {
                        return Err(classify(err, timeout));
                    }
                    // Deliver what we have; the error will resurface on the
                    // next poll if it persists.
                    warn!("poll interrupted: {err}");
                    break;
                }
            }
        }
        Ok(batch)
    }

    async fn commit(&mut self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(|e| classify(e, Duration::ZERO))?;
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| match e.rdkafka_error_code() {
                Some(RDKafkaErrorCode::UnknownMemberId)
                | Some(RDKafkaErrorCode::IllegalGeneration)
                | Some(RDKafkaErrorCode::RebalanceInProgress) => BrokerError::StaleMember,
                _ => classify(e, Duration::ZERO),
            })
    }

    async fn assignment(&mut self) -> Result<Vec<TopicPartition>> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| classify(e, Duration::ZERO))?;
        Ok(assignment
            .elements()
            .iter()
            .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
            .collect())
    }

    async fn leave(&mut self) -> Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}
