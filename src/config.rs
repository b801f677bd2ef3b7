//! Command-line and environment configuration.
//!
//! All knobs are clap arguments with environment fallbacks, so the service
//! can be configured either way: `cloudstream consume --topic events` or
//! `CLOUDSTREAM_TOPIC=events cloudstream consume`.

use std::time::Duration;

use broker_client::RetryPolicy;
use clap::Parser;
use event_consumer::ConsumerConfig;

/// Default CloudEvents source URI for produced events.
pub const DEFAULT_SOURCE: &str = "https://cloudstream/producer";

/// Default CloudEvents type for produced events.
pub const DEFAULT_EVENT_TYPE: &str = "io.cloudstream.producer";

/// Broker connection and topic options.
#[derive(Debug, Clone, Parser)]
pub struct BrokerOpts {
    /// Kafka bootstrap servers (comma-separated or multiple --brokers)
    #[arg(long, env = "CLOUDSTREAM_BROKERS", value_delimiter = ',', default_value = "localhost:9092")]
    pub brokers: Vec<String>,

    /// Topic events are published to and consumed from
    #[arg(long, env = "CLOUDSTREAM_TOPIC", default_value = "events")]
    pub topic: String,

    /// Partition count used when the topic has to be created
    #[arg(long, default_value_t = 3)]
    pub partitions: i32,

    /// Consumer group ID
    #[arg(long, env = "CLOUDSTREAM_GROUP_ID", default_value = "cloudstream")]
    pub group_id: String,

    /// Dead-letter topic name (default: "<topic>-dlq")
    #[arg(long, env = "CLOUDSTREAM_DEAD_LETTER_TOPIC")]
    pub dead_letter_topic: Option<String>,

    /// Consumer session timeout in milliseconds
    #[arg(long, default_value = "30000")]
    pub session_timeout_ms: String,

    /// Number of records to read from the broker per batch before
    /// processing and committing offsets
    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,
}

impl BrokerOpts {
    pub fn bootstrap(&self) -> String {
        self.brokers.join(",")
    }

    pub fn dead_letter_topic(&self) -> String {
        self.dead_letter_topic
            .clone()
            .unwrap_or_else(|| format!("{}-dlq", self.topic))
    }

    pub fn consumer_config(&self, retry: &RetryOpts) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(&self.topic, &self.group_id);
        config.dead_letter_topic = self.dead_letter_topic();
        config.batch_size = self.batch_size;
        config.handler_retry = retry.handler_policy();
        config
    }
}

/// Retry and backoff options, shared by publishing, handler dispatch and the
/// startup probe.
#[derive(Debug, Clone, Parser)]
pub struct RetryOpts {
    /// Maximum publish attempts against an unavailable broker
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    /// Base backoff delay in milliseconds
    #[arg(long, default_value_t = 100)]
    pub base_delay_ms: u64,

    /// Backoff multiplier
    #[arg(long, default_value_t = 2.0)]
    pub multiplier: f64,

    /// Backoff cap in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub max_delay_ms: u64,

    /// Handler attempts per record before it is dead-lettered
    #[arg(long, default_value_t = 3)]
    pub handler_attempts: u32,

    /// Broker connection attempts before startup fails
    #[arg(long, default_value_t = 5)]
    pub startup_attempts: u32,
}

impl RetryOpts {
    pub fn publish_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn handler_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.handler_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn startup_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.startup_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// CloudEvents attributes stamped on produced events.
#[derive(Debug, Clone, Parser)]
pub struct EventOpts {
    /// CloudEvents source URI
    #[arg(long, env = "CLOUDSTREAM_SOURCE", default_value = DEFAULT_SOURCE)]
    pub source: String,

    /// CloudEvents type
    #[arg(long, env = "CLOUDSTREAM_EVENT_TYPE", default_value = DEFAULT_EVENT_TYPE)]
    pub event_type: String,
}
