//! Delivery-guarantee tests: at-least-once redelivery, rebalance splits,
//! poison isolation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker_client::{Broker, MemoryBroker, RetryPolicy};
use cloudstream::config::{DEFAULT_EVENT_TYPE, DEFAULT_SOURCE};
use event_consumer::{Consumer, ConsumerConfig, HandlerError};
use event_generator::{DataGenerator, Person};
use event_producer::{EventWriter, Producer};
use event_types::Envelope;
use tokio_util::sync::CancellationToken;

async fn publish_people(
    broker: &MemoryBroker,
    topic: &str,
    partitions: i32,
    count: u64,
) -> Vec<Person> {
    broker.ensure_topic(topic, partitions).await.unwrap();
    let producer = Arc::new(Producer::new(
        Arc::new(broker.clone()) as Arc<dyn Broker>,
        RetryPolicy::default(),
    ));
    let writer = EventWriter::new(producer, topic, DEFAULT_SOURCE, DEFAULT_EVENT_TYPE);

    let mut generator = DataGenerator::new(7);
    let people = generator.people(count);
    for person in &people {
        writer.write(&person.id, person).await.unwrap();
    }
    people
}

fn fast_config(topic: &str, group: &str) -> ConsumerConfig {
    let mut config = ConsumerConfig::new(topic, group);
    config.poll_timeout = Duration::from_millis(50);
    config.handler_retry =
        RetryPolicy::new(2, Duration::from_millis(1), 2.0, Duration::from_millis(5));
    config
}

/// A member that crashes after handling but before committing loses nothing:
/// the records are redelivered to the next member of the group.
#[tokio::test]
async fn test_at_least_once_redelivery_after_crash() {
    let broker = MemoryBroker::new();
    let people = publish_people(&broker, "events", 1, 3).await;

    // First incarnation: fetch and "handle" everything, then crash before
    // any offset is committed.
    {
        let mut membership = broker
            .join_group("test-group", &["events".to_string()])
            .await
            .unwrap();
        let batch = membership.poll(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 3);
        // Dropped without commit: the crash.
    }

    // Second incarnation sees every record again.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();
    let mut consumer = Consumer::new(
        Arc::new(broker.clone()) as Arc<dyn Broker>,
        fast_config("events", "test-group"),
    );
    let handler = {
        let seen = Arc::clone(&seen);
        let cancel = cancel.clone();
        move |envelope: &Envelope| {
            let person: Person = envelope
                .decode_payload()
                .map_err(|e| HandlerError::msg(e.to_string()))?;
            let mut seen = seen.lock().unwrap();
            seen.push(person.id.clone());
            if seen.len() >= 3 {
                cancel.cancel();
            }
            Ok(())
        }
    };
    tokio::time::timeout(Duration::from_secs(5), consumer.run(handler, cancel))
        .await
        .unwrap()
        .unwrap();

    let expected: Vec<String> = people.iter().map(|p| p.id.clone()).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

/// A second member joining the group takes over half the partitions.
#[tokio::test]
async fn test_second_member_splits_the_assignment() {
    let broker = MemoryBroker::new();
    broker.ensure_topic("events", 4).await.unwrap();

    let mut first = broker
        .join_group("test-group", &["events".to_string()])
        .await
        .unwrap();
    assert_eq!(first.assignment().await.unwrap().len(), 4);

    let mut second = broker
        .join_group("test-group", &["events".to_string()])
        .await
        .unwrap();

    let first_assignment = first.assignment().await.unwrap();
    let second_assignment = second.assignment().await.unwrap();
    assert_eq!(first_assignment.len(), 2);
    assert_eq!(second_assignment.len(), 2);
    assert!(first_assignment
        .iter()
        .all(|tp| !second_assignment.contains(tp)));
}

/// A permanently failing record is dead-lettered exactly once and does not
/// block the records behind it.
#[tokio::test]
async fn test_poison_record_does_not_block_the_stream() {
    let broker = MemoryBroker::new();
    let people = publish_people(&broker, "events", 1, 3).await;
    let poison_id = people[1].id.clone();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();
    let config = fast_config("events", "test-group");
    let dead_letter_topic = config.dead_letter_topic.clone();
    let mut consumer = Consumer::new(Arc::new(broker.clone()) as Arc<dyn Broker>, config);

    let handler = {
        let seen = Arc::clone(&seen);
        let cancel = cancel.clone();
        let poison_id = poison_id.clone();
        move |envelope: &Envelope| {
            let person: Person = envelope
                .decode_payload()
                .map_err(|e| HandlerError::msg(e.to_string()))?;
            if person.id == poison_id {
                return Err(HandlerError::msg("this record never succeeds"));
            }
            let mut seen = seen.lock().unwrap();
            seen.push(person.id.clone());
            if seen.len() >= 2 {
                cancel.cancel();
            }
            Ok(())
        }
    };
    tokio::time::timeout(Duration::from_secs(5), consumer.run(handler, cancel))
        .await
        .unwrap()
        .unwrap();

    // The two healthy records made it through, in order.
    assert_eq!(
        *seen.lock().unwrap(),
        vec![people[0].id.clone(), people[2].id.clone()]
    );

    // The poisoned record is in the dead-letter topic exactly once.
    let dead = broker.fetch_from(&dead_letter_topic, 0, 0).unwrap();
    assert_eq!(dead.len(), 1);
    let envelope = Envelope::from_bytes(&dead[0].payload).unwrap();
    let person: Person = envelope.decode_payload().unwrap();
    assert_eq!(person.id, poison_id);
}
