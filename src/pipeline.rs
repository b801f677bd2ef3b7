//! Self-contained in-process pipeline demo.
//!
//! Wires the whole path together against the in-memory broker: seeded
//! generator, CloudEvents writer, consumer group, dead-letter sink. The
//! `pipeline` subcommand runs this to demonstrate the system without a Kafka
//! deployment; the integration tests drive the same wiring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use broker_client::{Broker, MemoryBroker, RetryPolicy};
use event_consumer::{Consumer, ConsumerConfig};
use event_generator::DataGenerator;
use event_producer::{EventWriter, Producer};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{DEFAULT_EVENT_TYPE, DEFAULT_SOURCE};

/// Outcome of a demo pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSummary {
    pub published: u64,
    pub consumed: u64,
    pub dead_lettered: u64,
}

/// Publish `count` generated person events to an in-memory broker and
/// consume them all with a logging handler.
pub async fn run_pipeline(count: u64, seed: u64) -> anyhow::Result<PipelineSummary> {
    let broker = MemoryBroker::new();
    broker.ensure_topic("events", 3).await?;
    let shared: Arc<dyn Broker> = Arc::new(broker.clone());

    let config = ConsumerConfig::new("events", "pipeline");
    let dead_letter_topic = config.dead_letter_topic.clone();

    // Consumer first, so it is polling while events arrive.
    let consumed = Arc::new(AtomicU64::new(0));
    let cancel = CancellationToken::new();
    let mut consumer = Consumer::new(Arc::clone(&shared), config);
    let consumer_task = tokio::spawn({
        let counter = Arc::clone(&consumed);
        let cancel = cancel.clone();
        async move {
            consumer
                .run(
                    move |envelope: &event_types::Envelope| {
                        info!(
                            "Received event. Id: {}; Name: {}",
                            envelope.id,
                            envelope.extension_str("name").unwrap_or("<none>")
                        );
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    cancel,
                )
                .await
        }
    });

    let producer = Arc::new(Producer::new(Arc::clone(&shared), RetryPolicy::default()));
    let writer = EventWriter::new(producer, "events", DEFAULT_SOURCE, DEFAULT_EVENT_TYPE);

    let mut generator = DataGenerator::new(seed);
    for _ in 0..count {
        let person = generator.next_person();
        writer
            .write_with(&person.id, &[("name", person.name.clone())], &person)
            .await?;
    }
    info!("published {count} events to 'events'");

    // Wait for the consumer to drain the topic, then shut it down.
    let deadline = Instant::now() + Duration::from_secs(10);
    while consumed.load(Ordering::SeqCst) < count && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cancel.cancel();
    consumer_task
        .await
        .context("consumer task panicked")?
        .context("consumer failed")?;

    let dead_lettered = broker
        .fetch_from(&dead_letter_topic, 0, 0)
        .map(|records| records.len() as u64)
        .unwrap_or(0);

    Ok(PipelineSummary {
        published: count,
        consumed: consumed.load(Ordering::SeqCst),
        dead_lettered,
    })
}
