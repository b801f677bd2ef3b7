//! Pipeline integration tests
//!
//! Drive the full generate -> produce -> consume path against the in-memory
//! broker backend, which shares the Kafka backend's observable semantics
//! (partition ordering, group rebalancing, committed offsets) without
//! requiring a running broker.

mod delivery;
mod end_to_end;
