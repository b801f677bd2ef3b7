//! Command-line interface for cloudstream
//!
//! # Usage Examples
//!
//! ```bash
//! # Publish 10 generated person events to Kafka
//! cloudstream produce \
//!   --brokers localhost:9092 \
//!   --topic events \
//!   --count 10 --seed 42
//!
//! # Consume events with a logging handler until Ctrl-C
//! cloudstream consume \
//!   --brokers localhost:9092 \
//!   --topic events \
//!   --group-id demo
//!
//! # Run the whole pipeline in-process against the in-memory broker
//! cloudstream pipeline --count 10
//! ```
//!
//! Exit code is 0 on graceful shutdown and non-zero when startup fails, e.g.
//! when the broker stays unreachable past the startup retry budget.

use std::sync::Arc;

use anyhow::Context;
use broker_client::{Broker, KafkaBroker};
use clap::{Parser, Subcommand, ValueEnum};
use cloudstream::config::{BrokerOpts, EventOpts, RetryOpts};
use cloudstream::pipeline::run_pipeline;
use event_consumer::{Consumer, HandlerError};
use event_generator::DataGenerator;
use event_producer::{EventWriter, Producer};
use event_types::Envelope;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cloudstream")]
#[command(about = "A CloudEvents producer/consumer pipeline over Kafka-compatible brokers")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate synthetic records and publish them as CloudEvents
    Produce {
        #[command(flatten)]
        broker: BrokerOpts,

        #[command(flatten)]
        retry: RetryOpts,

        #[command(flatten)]
        event: EventOpts,

        /// Number of records to publish
        #[arg(long, default_value_t = 10)]
        count: u64,

        /// Generator seed (same seed, same records)
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Kind of synthetic payload to generate
        #[arg(long, value_enum, default_value_t = PayloadKind::Person)]
        payload: PayloadKind,
    },

    /// Consume CloudEvents and log them until interrupted
    Consume {
        #[command(flatten)]
        broker: BrokerOpts,

        #[command(flatten)]
        retry: RetryOpts,
    },

    /// Run generate -> produce -> consume end to end in-process
    Pipeline {
        /// Number of records to push through the pipeline
        #[arg(long, default_value_t = 10)]
        count: u64,

        /// Generator seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum PayloadKind {
    Person,
    Order,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Produce {
            broker,
            retry,
            event,
            count,
            seed,
            payload,
        } => {
            let client = connect_broker(&broker, &retry).await?;
            produce(client, &broker, &retry, &event, count, seed, payload).await
        }
        Commands::Consume { broker, retry } => {
            let client = connect_broker(&broker, &retry).await?;
            consume(client, &broker, &retry).await
        }
        Commands::Pipeline { count, seed } => {
            let summary = run_pipeline(count, seed).await?;
            info!(
                "pipeline complete: published={} consumed={} dead_lettered={}",
                summary.published, summary.consumed, summary.dead_lettered
            );
            if summary.consumed < summary.published {
                anyhow::bail!(
                    "pipeline incomplete: consumed {} of {} events",
                    summary.consumed,
                    summary.published
                );
            }
            Ok(())
        }
    }
}

/// Connect to Kafka and probe reachability by ensuring the topics exist,
/// retrying under the startup budget. Failing here is fatal: the process
/// exits non-zero.
async fn connect_broker(opts: &BrokerOpts, retry: &RetryOpts) -> anyhow::Result<Arc<KafkaBroker>> {
    let broker = KafkaBroker::connect(&opts.bootstrap())
        .map(|broker| broker.with_session_timeout_ms(opts.session_timeout_ms.clone()))
        .context("failed to create Kafka client")?;
    let broker = Arc::new(broker);

    let policy = retry.startup_policy();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match broker.ensure_topic(&opts.topic, opts.partitions).await {
            Ok(()) => break,
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt - 1);
                warn!("broker not reachable (attempt {attempt}): {err}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("broker unreachable after {attempt} attempts")));
            }
        }
    }
    broker.ensure_topic(&opts.dead_letter_topic(), 1).await?;
    info!("connected to broker at {}", opts.bootstrap());
    Ok(broker)
}

async fn produce(
    client: Arc<KafkaBroker>,
    opts: &BrokerOpts,
    retry: &RetryOpts,
    event: &EventOpts,
    count: u64,
    seed: u64,
    payload: PayloadKind,
) -> anyhow::Result<()> {
    let producer = Arc::new(Producer::new(
        Arc::clone(&client) as Arc<dyn Broker>,
        retry.publish_policy(),
    ));
    let writer = EventWriter::new(producer, &opts.topic, &event.source, &event.event_type);

    let mut generator = DataGenerator::new(seed);
    for _ in 0..count {
        match payload {
            PayloadKind::Person => {
                let person = generator.next_person();
                let ack = writer
                    .write_with(&person.id, &[("name", person.name.clone())], &person)
                    .await?;
                info!(
                    "published person '{}' to {}/{} at offset {}",
                    person.name, opts.topic, ack.partition, ack.offset
                );
            }
            PayloadKind::Order => {
                let order = generator.next_order();
                let ack = writer.write(&order.id, &order).await?;
                info!(
                    "published order '{}' to {}/{} at offset {}",
                    order.id, opts.topic, ack.partition, ack.offset
                );
            }
        }
    }

    info!("published {count} events to '{}'", opts.topic);
    client.close().await?;
    Ok(())
}

async fn consume(client: Arc<KafkaBroker>, opts: &BrokerOpts, retry: &RetryOpts) -> anyhow::Result<()> {
    let mut consumer = Consumer::new(
        Arc::clone(&client) as Arc<dyn Broker>,
        opts.consumer_config(retry),
    );

    let handler = |envelope: &Envelope| {
        match envelope.decode_payload::<serde_json::Value>() {
            Ok(data) => info!("Received event. Id: {}; Data: {}", envelope.id, data),
            Err(_) if !envelope.has_data() => warn!("No data in event {}", envelope.id),
            Err(err) => return Err(HandlerError::msg(err.to_string())),
        }
        Ok(())
    };

    let cancel = CancellationToken::new();
    let consumer_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { consumer.run(handler, cancel).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    cancel.cancel();
    consumer_task
        .await
        .context("consumer task panicked")?
        .context("consumer failed")?;
    client.close().await?;
    Ok(())
}
