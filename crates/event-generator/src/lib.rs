//! Synthetic-data generator for cloudstream.
//!
//! Produces fake [`Person`] and [`Order`] records for exercising the event
//! pipeline. The generator uses a seeded RNG so the same seed always yields
//! the same sequence of records, which is what the end-to-end tests rely on
//! to compare consumed payloads against generated ones.
//!
//! ```text
//! seed
//!   │
//!   ▼
//! ┌───────────────┐
//! │ DataGenerator │
//! │  - rng (StdRng)│
//! │  - index      │
//! └──────┬────────┘
//!        │
//!        ▼
//!   Person { id, name, email, age, company }
//! ```
//!
//! These records are demo payloads only; the pipeline itself treats event
//! data as opaque JSON.

pub mod datasets;
pub mod generator;

pub use generator::{DataGenerator, Order, Person};
