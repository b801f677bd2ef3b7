//! Event consumption for cloudstream.
//!
//! [`Consumer::run`] drives one consumer-group member through its lifecycle:
//!
//! ```text
//! Disconnected -> Joining -> Polling -> Processing -> Committing
//!                    ▲          ▲                         │
//!                    │          └─────────────────────────┘
//!                    └── rebalance failure / lost membership
//! ```
//!
//! Each polled batch is dispatched to the handler in partition order, with
//! bounded retries per record. Records that keep failing (and records that do
//! not decode at all) are routed to the dead-letter sink and the loop moves
//! on; offsets are committed per partition only once the partition's slice of
//! the batch is fully handled, which is what makes delivery at-least-once.

pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod state;

pub use consumer::{Consumer, ConsumerConfig};
pub use dead_letter::DeadLetterSink;
pub use error::{ConsumerError, HandlerError};
pub use state::ConsumerState;
