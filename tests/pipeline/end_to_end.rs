//! End-to-end scenario: generated records published as CloudEvents and
//! consumed back in partition order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker_client::{Broker, MemoryBroker, RetryPolicy};
use cloudstream::config::{DEFAULT_EVENT_TYPE, DEFAULT_SOURCE};
use event_consumer::{Consumer, ConsumerConfig};
use event_generator::{DataGenerator, Person};
use event_producer::{EventWriter, Producer};
use event_types::Envelope;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_ten_records_flow_through_in_partition_order(
) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("cloudstream=debug,event_consumer=debug")
        .try_init()
        .ok();

    let broker = MemoryBroker::new();
    broker.ensure_topic("events", 3).await?;
    let shared: Arc<dyn Broker> = Arc::new(broker.clone());

    // Generate and publish 10 person records, remembering where each landed.
    let mut generator = DataGenerator::new(42);
    let people = generator.people(10);

    let producer = Arc::new(Producer::new(Arc::clone(&shared), RetryPolicy::default()));
    let writer = EventWriter::new(producer, "events", DEFAULT_SOURCE, DEFAULT_EVENT_TYPE);

    let mut partition_of: HashMap<String, i32> = HashMap::new();
    let mut published_order: HashMap<i32, Vec<String>> = HashMap::new();
    for person in &people {
        let ack = writer
            .write_with(&person.id, &[("name", person.name.clone())], person)
            .await?;
        partition_of.insert(person.id.clone(), ack.partition);
        published_order
            .entry(ack.partition)
            .or_default()
            .push(person.id.clone());
    }

    // Consume with group "test-group" until all 10 arrived.
    let consumed: Arc<Mutex<Vec<Person>>> = Arc::new(Mutex::new(Vec::new()));
    let invocations = Arc::new(Mutex::new(0usize));
    let cancel = CancellationToken::new();
    let mut consumer = Consumer::new(Arc::clone(&shared), ConsumerConfig::new("events", "test-group"));
    let consumer_task = tokio::spawn({
        let consumed = Arc::clone(&consumed);
        let invocations = Arc::clone(&invocations);
        let cancel = cancel.clone();
        let handler_cancel = cancel.clone();
        async move {
            consumer
                .run(
                    move |envelope: &Envelope| {
                        *invocations.lock().unwrap() += 1;
                        let person: Person = envelope
                            .decode_payload()
                            .map_err(|e| event_consumer::HandlerError::msg(e.to_string()))?;
                        let mut consumed = consumed.lock().unwrap();
                        consumed.push(person);
                        if consumed.len() >= 10 {
                            handler_cancel.cancel();
                        }
                        Ok(())
                    },
                    cancel,
                )
                .await
        }
    });
    tokio::time::timeout(Duration::from_secs(10), consumer_task).await???;

    // Exactly 10 handler invocations, payloads matching the generated
    // records.
    assert_eq!(*invocations.lock().unwrap(), 10);
    let consumed = consumed.lock().unwrap();
    let mut consumed_sorted: Vec<&Person> = consumed.iter().collect();
    consumed_sorted.sort_by(|a, b| a.id.cmp(&b.id));
    let mut generated_sorted: Vec<&Person> = people.iter().collect();
    generated_sorted.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(consumed_sorted, generated_sorted);

    // Within each partition, consumption order equals publish order.
    for (partition, expected) in &published_order {
        let observed: Vec<String> = consumed
            .iter()
            .filter(|person| partition_of[&person.id] == *partition)
            .map(|person| person.id.clone())
            .collect();
        assert_eq!(&observed, expected, "order broken in partition {partition}");
    }

    Ok(())
}
