//! Domain record to CloudEvents envelope bridging.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use event_types::Envelope;
use serde::Serialize;
use uuid::Uuid;

use crate::error::PublishError;
use crate::producer::{Ack, Producer, PARTITION_KEY_EXTENSION};

/// Wraps domain records into envelopes and publishes them to one topic.
///
/// Every envelope gets a fresh UUID id, the writer's configured source URI
/// and event type, and a production timestamp that never goes backwards for
/// this writer instance, even if the wall clock does.
pub struct EventWriter {
    producer: Arc<Producer>,
    topic: String,
    source: String,
    event_type: String,
    last_time: Mutex<DateTime<Utc>>,
}

impl EventWriter {
    pub fn new(
        producer: Arc<Producer>,
        topic: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            producer,
            topic: topic.into(),
            source: source.into(),
            event_type: event_type.into(),
            last_time: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Build the envelope for a record without publishing it.
    ///
    /// `key` becomes the `partitionkey` extension, so events for the same
    /// record always land on the same partition.
    pub fn envelope_for<T: Serialize>(
        &self,
        key: &str,
        extensions: &[(&str, String)],
        record: &T,
    ) -> Result<Envelope, PublishError> {
        let mut builder = Envelope::builder()
            .id(Uuid::new_v4().to_string())
            .source(self.source.clone())
            .event_type(self.event_type.clone())
            .time(self.monotonic_now())
            .extension(PARTITION_KEY_EXTENSION, key);
        for (name, value) in extensions {
            builder = builder.extension(*name, value.clone());
        }
        Ok(builder.json_data(record)?.build()?)
    }

    /// Wrap a record and publish it.
    pub async fn write<T: Serialize>(&self, key: &str, record: &T) -> Result<Ack, PublishError> {
        self.write_with(key, &[], record).await
    }

    /// Wrap a record with extra extension attributes and publish it.
    pub async fn write_with<T: Serialize>(
        &self,
        key: &str,
        extensions: &[(&str, String)],
        record: &T,
    ) -> Result<Ack, PublishError> {
        let envelope = self.envelope_for(key, extensions, record)?;
        self.producer.publish(&self.topic, &envelope).await
    }

    /// Current time, clamped to never precede the last issued timestamp.
    fn monotonic_now(&self) -> DateTime<Utc> {
        let mut last = self.last_time.lock().expect("writer clock poisoned");
        let now = Utc::now().max(*last);
        *last = now;
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_client::{Broker, MemoryBroker, RetryPolicy};
    use event_generator::DataGenerator;

    async fn writer() -> (MemoryBroker, EventWriter) {
        let broker = MemoryBroker::new();
        broker.ensure_topic("events", 2).await.unwrap();
        let producer = Arc::new(Producer::new(
            Arc::new(broker.clone()),
            RetryPolicy::no_retries(),
        ));
        let writer = EventWriter::new(
            producer,
            "events",
            "https://cloudstream/producer",
            "io.cloudstream.producer",
        );
        (broker, writer)
    }

    #[tokio::test]
    async fn test_written_envelope_carries_record_and_attributes() {
        let (broker, writer) = writer().await;
        let mut generator = DataGenerator::new(42);
        let person = generator.next_person();

        let ack = writer
            .write_with(&person.id, &[("name", person.name.clone())], &person)
            .await
            .unwrap();

        let records = broker.fetch_from("events", ack.partition, ack.offset).unwrap();
        let envelope = Envelope::from_bytes(&records[0].payload).unwrap();
        assert_eq!(envelope.source, "https://cloudstream/producer");
        assert_eq!(envelope.event_type, "io.cloudstream.producer");
        assert_eq!(envelope.extension_str("name"), Some(person.name.as_str()));
        assert_eq!(
            envelope.extension_str(PARTITION_KEY_EXTENSION),
            Some(person.id.as_str())
        );
        let decoded: event_generator::Person = envelope.decode_payload().unwrap();
        assert_eq!(decoded, person);
    }

    #[tokio::test]
    async fn test_event_ids_are_unique_and_time_is_monotonic() {
        let (_broker, writer) = writer().await;
        let mut generator = DataGenerator::new(7);

        let mut ids = Vec::new();
        let mut times = Vec::new();
        for _ in 0..5 {
            let person = generator.next_person();
            let envelope = writer.envelope_for(&person.id, &[], &person).unwrap();
            ids.push(envelope.id.clone());
            times.push(envelope.time.unwrap());
        }

        let mut deduped = ids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
        assert!(times.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}
