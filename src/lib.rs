//! cloudstream library
//!
//! A CloudEvents producer/consumer pipeline over Kafka-compatible brokers.
//!
//! # Features
//!
//! - CloudEvents v1.0 envelopes in JSON structured mode
//! - At-least-once consumption: offsets commit only after successful handling
//! - Bounded handler retries with dead-letter routing for poison messages
//! - Partition-ordered dispatch, key-hash or round-robin partitioning
//! - Seeded synthetic-data generator for demo and test payloads
//!
//! # Pipeline Crates
//!
//! Each concern lives in its own crate:
//!
//! - `event_types` - envelope definition and codec
//! - `event_generator` - fake person/order records
//! - `broker_client` - broker seam, Kafka and in-memory backends, retry policy
//! - `event_producer` - publishing with partitioning and backoff
//! - `event_consumer` - poll loop, dead-lettering, offset commits
//!
//! # CLI Usage
//!
//! ```bash
//! # Publish 10 generated person events
//! cloudstream produce --brokers localhost:9092 --topic events --count 10
//!
//! # Consume and log events until Ctrl-C
//! cloudstream consume --brokers localhost:9092 --topic events --group-id demo
//!
//! # End-to-end in-process demo, no Kafka required
//! cloudstream pipeline --count 10
//! ```

pub mod config;
pub mod pipeline;

// Re-export the pipeline crates for convenience
pub use broker_client as broker;
pub use event_consumer as consumer;
pub use event_generator as generator;
pub use event_producer as producer;
pub use event_types as events;
