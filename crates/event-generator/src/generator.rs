//! Seeded generator producing fake person and order records.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datasets::{COMPANIES, EMAIL_DOMAINS, FIRST_NAMES, ITEMS, LAST_NAMES};

/// A fake person record, the default demo payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub email: String,
    pub age: i64,
    pub company: String,
}

/// A fake order record, an alternative demo payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub customer: String,
    pub item: String,
    pub quantity: u32,
    pub total: f64,
}

/// Generator that produces deterministic fake records.
///
/// The same seed always produces the same sequence. Record ids are
/// UUID-v4-shaped but drawn from the seeded RNG, so they are deterministic
/// too while still being unique per record.
pub struct DataGenerator {
    rng: StdRng,
    index: u64,
}

impl DataGenerator {
    /// Create a new generator with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            index: 0,
        }
    }

    /// Number of records generated so far.
    pub fn current_index(&self) -> u64 {
        self.index
    }

    /// Generate the next fake person.
    pub fn next_person(&mut self) -> Person {
        let index = self.index;
        self.index += 1;

        let first = *FIRST_NAMES.choose(&mut self.rng).unwrap();
        let last = *LAST_NAMES.choose(&mut self.rng).unwrap();
        let domain = *EMAIL_DOMAINS.choose(&mut self.rng).unwrap();

        Person {
            id: self.next_id().to_string(),
            name: format!("{first} {last}"),
            email: format!(
                "{}.{}{}@{}",
                first.to_ascii_lowercase(),
                last.to_ascii_lowercase(),
                index,
                domain
            ),
            age: self.rng.gen_range(18..=79),
            company: (*COMPANIES.choose(&mut self.rng).unwrap()).to_string(),
        }
    }

    /// Generate the next fake order.
    pub fn next_order(&mut self) -> Order {
        self.index += 1;

        let first = *FIRST_NAMES.choose(&mut self.rng).unwrap();
        let last = *LAST_NAMES.choose(&mut self.rng).unwrap();
        let quantity = self.rng.gen_range(1..=9u32);
        let unit_price: f64 = self.rng.gen_range(5.0..500.0);

        Order {
            id: self.next_id().to_string(),
            customer: format!("{first} {last}"),
            item: (*ITEMS.choose(&mut self.rng).unwrap()).to_string(),
            quantity,
            // Two decimal places, like a price.
            total: (unit_price * quantity as f64 * 100.0).round() / 100.0,
        }
    }

    /// Generate a batch of fake persons.
    pub fn people(&mut self, count: u64) -> Vec<Person> {
        (0..count).map(|_| self.next_person()).collect()
    }

    /// Generate a batch of fake orders.
    pub fn orders(&mut self, count: u64) -> Vec<Order> {
        (0..count).map(|_| self.next_order()).collect()
    }

    fn next_id(&mut self) -> Uuid {
        uuid::Builder::from_random_bytes(self.rng.gen()).into_uuid()
    }
}
