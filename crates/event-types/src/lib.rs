//! CloudEvents envelope types for cloudstream.
//!
//! This crate defines the wire representation shared by the producer and
//! consumer sides of the pipeline:
//!
//! - [`Envelope`] - a CloudEvents v1.0 event in JSON structured mode
//! - [`EventBuilder`] - builder for assembling envelopes attribute by attribute
//! - [`DecodeError`] / [`EncodeError`] - codec error taxonomy
//!
//! # Dependency Direction
//!
//! Both the producer and consumer crates depend on event-types for the shared
//! envelope definition. This crate depends on nothing else in the workspace,
//! so the wire format has a single owner.
//!
//! # Example
//!
//! ```rust
//! use event_types::Envelope;
//!
//! let envelope = Envelope::builder()
//!     .id("5e6f7a8b")
//!     .source("https://cloudstream/producer")
//!     .event_type("io.cloudstream.producer")
//!     .json_data(&serde_json::json!({"name": "Alice Smith"}))
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let bytes = envelope.to_bytes().unwrap();
//! let decoded = Envelope::from_bytes(&bytes).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod envelope;
pub mod error;

pub use envelope::{BuilderError, Envelope, EventBuilder, CONTENT_TYPE_CLOUDEVENTS_JSON, SPEC_VERSION};
pub use error::{DecodeError, EncodeError};
