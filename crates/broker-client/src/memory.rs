//! In-process broker backend.
//!
//! A partitioned append-only log plus consumer-group bookkeeping, sharing the
//! observable semantics of the Kafka backend: per-partition ordering,
//! committed offsets owned by the group, round-robin partition assignment
//! recomputed when members join or leave, and rejection of commits from
//! members that lost their assignment in a rebalance.
//!
//! Fetch positions are member-local and reset to the committed offset on
//! every (re)join, which is exactly what makes uncommitted work redeliverable
//! and gives the pipeline its at-least-once guarantee in tests and demos.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::record::{FetchedRecord, Record, TopicPartition};
use crate::{Broker, BrokerError, GroupMembership, Result};

struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    headers: Vec<(String, String)>,
    timestamp: i64,
}

struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
}

#[derive(Default)]
struct GroupState {
    generation: u64,
    /// member id -> subscribed topics
    members: BTreeMap<u64, Vec<String>>,
    /// member id -> assigned partitions
    assignments: HashMap<u64, Vec<TopicPartition>>,
    /// next offset to read, per partition
    committed: HashMap<TopicPartition, i64>,
}

impl GroupState {
    /// Recompute partition ownership: for every subscribed topic, partitions
    /// are dealt round-robin across the members subscribed to it, in member
    /// id order.
    fn rebalance(&mut self, topics: &HashMap<String, TopicLog>) {
        self.assignments.clear();
        let mut subscribed: Vec<&String> = self
            .members
            .values()
            .flat_map(|topics| topics.iter())
            .collect();
        subscribed.sort();
        subscribed.dedup();

        for topic in subscribed {
            let Some(log) = topics.get(topic.as_str()) else {
                continue;
            };
            let members: Vec<u64> = self
                .members
                .iter()
                .filter(|(_, subs)| subs.contains(topic))
                .map(|(id, _)| *id)
                .collect();
            if members.is_empty() {
                continue;
            }
            for partition in 0..log.partitions.len() {
                let owner = members[partition % members.len()];
                self.assignments
                    .entry(owner)
                    .or_default()
                    .push(TopicPartition::new(topic.clone(), partition as i32));
            }
        }
        for assigned in self.assignments.values_mut() {
            assigned.sort();
        }
    }
}

#[derive(Default)]
struct SharedState {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<String, GroupState>,
    next_member_id: u64,
    closed: bool,
}

/// In-memory [`Broker`] implementation.
///
/// Cheap to clone; clones share the same logs and groups.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<SharedState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read records of one partition starting at `offset`, outside of any
    /// consumer group. Used by tests and demos to inspect topics such as the
    /// dead-letter sink.
    pub fn fetch_from(&self, topic: &str, partition: i32, offset: i64) -> Result<Vec<FetchedRecord>> {
        let state = self.state.lock().expect("broker state poisoned");
        let log = state
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        let records = log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;
        Ok(records
            .iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(|(i, stored)| to_fetched(topic, partition, i as i64, stored))
            .collect())
    }
}

fn to_fetched(topic: &str, partition: i32, offset: i64, stored: &StoredRecord) -> FetchedRecord {
    FetchedRecord {
        topic: topic.to_string(),
        partition,
        offset,
        key: stored.key.clone(),
        payload: stored.payload.clone(),
        headers: stored.headers.clone(),
        timestamp: Some(stored.timestamp),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_topic(&self, topic: &str, partitions: i32) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.topics.contains_key(topic) {
            debug!("Topic '{topic}' already exists");
            return Ok(());
        }
        let count = partitions.max(1) as usize;
        state.topics.insert(
            topic.to_string(),
            TopicLog {
                partitions: (0..count).map(|_| Vec::new()).collect(),
            },
        );
        debug!("Topic '{topic}' created with {count} partitions");
        Ok(())
    }

    async fn partition_count(&self, topic: &str) -> Result<i32> {
        let state = self.state.lock().expect("broker state poisoned");
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state
            .topics
            .get(topic)
            .map(|log| log.partitions.len() as i32)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))
    }

    async fn append(&self, topic: &str, partition: i32, record: Record) -> Result<i64> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let log = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        let records = log
            .partitions
            .get_mut(partition as usize)
            .ok_or_else(|| BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;
        records.push(StoredRecord {
            key: record.key,
            payload: record.payload,
            headers: record.headers,
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        Ok(records.len() as i64 - 1)
    }

    async fn join_group(&self, group: &str, topics: &[String]) -> Result<Box<dyn GroupMembership>> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.next_member_id += 1;
        let member_id = state.next_member_id;

        let SharedState { topics: logs, groups, .. } = &mut *state;
        let group_state = groups.entry(group.to_string()).or_default();
        group_state.members.insert(member_id, topics.to_vec());
        group_state.generation += 1;
        group_state.rebalance(logs);
        let generation = group_state.generation;
        debug!(group, member_id, generation, "member joined group");

        Ok(Box::new(MemoryMembership {
            state: Arc::clone(&self.state),
            group: group.to_string(),
            member_id,
            seen_generation: generation,
            positions: HashMap::new(),
            left: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        state.closed = true;
        Ok(())
    }
}

/// One member of a consumer group on a [`MemoryBroker`].
pub struct MemoryMembership {
    state: Arc<Mutex<SharedState>>,
    group: String,
    member_id: u64,
    /// Group generation this member last observed; a mismatch means a
    /// rebalance happened and fetch positions must reset to committed.
    seen_generation: u64,
    positions: HashMap<TopicPartition, i64>,
    left: bool,
}

impl MemoryMembership {
    fn try_poll(&mut self, max_records: usize) -> Result<Vec<FetchedRecord>> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let SharedState { topics, groups, .. } = &mut *state;
        let group = groups.get(&self.group).ok_or(BrokerError::StaleMember)?;
        if !group.members.contains_key(&self.member_id) {
            return Err(BrokerError::StaleMember);
        }
        if group.generation != self.seen_generation {
            debug!(
                group = %self.group,
                member_id = self.member_id,
                generation = group.generation,
                "rebalance observed, resetting fetch positions to committed offsets"
            );
            self.seen_generation = group.generation;
            self.positions.clear();
        }

        let assigned = group
            .assignments
            .get(&self.member_id)
            .cloned()
            .unwrap_or_default();
        let mut batch = Vec::new();
        for tp in assigned {
            let committed = group.committed.get(&tp).copied().unwrap_or(0);
            let position = self.positions.entry(tp.clone()).or_insert(committed);
            let Some(log) = topics.get(&tp.topic) else {
                continue;
            };
            let Some(records) = log.partitions.get(tp.partition as usize) else {
                continue;
            };
            while (*position as usize) < records.len() && batch.len() < max_records {
                let offset = *position;
                batch.push(to_fetched(
                    &tp.topic,
                    tp.partition,
                    offset,
                    &records[offset as usize],
                ));
                *position += 1;
            }
            if batch.len() >= max_records {
                break;
            }
        }
        Ok(batch)
    }

    fn remove_from_group(&mut self) {
        let mut state = self.state.lock().expect("broker state poisoned");
        let SharedState { topics, groups, .. } = &mut *state;
        if let Some(group) = groups.get_mut(&self.group) {
            if group.members.remove(&self.member_id).is_some() {
                group.generation += 1;
                group.rebalance(topics);
                debug!(
                    group = %self.group,
                    member_id = self.member_id,
                    generation = group.generation,
                    "member left group"
                );
            }
        }
        self.left = true;
    }
}

#[async_trait]
impl GroupMembership for MemoryMembership {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<Vec<FetchedRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.try_poll(max_records)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(10).min(deadline - now)).await;
        }
    }

    async fn commit(&mut self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let mut state = self.state.lock().expect("broker state poisoned");
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let SharedState { topics, groups, .. } = &mut *state;
        let group = groups.get_mut(&self.group).ok_or(BrokerError::StaleMember)?;
        let tp = TopicPartition::new(topic, partition);

        // A commit is only valid from the generation the records were
        // fetched in, and only for partitions this member still owns.
        if group.generation != self.seen_generation
            || !group.members.contains_key(&self.member_id)
            || !group
                .assignments
                .get(&self.member_id)
                .is_some_and(|assigned| assigned.contains(&tp))
        {
            return Err(BrokerError::StaleMember);
        }

        let log = topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        if log.partitions.get(partition as usize).is_none() {
            return Err(BrokerError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            });
        }
        group.committed.insert(tp, next_offset);
        Ok(())
    }

    async fn assignment(&mut self) -> Result<Vec<TopicPartition>> {
        let state = self.state.lock().expect("broker state poisoned");
        let group = state.groups.get(&self.group).ok_or(BrokerError::StaleMember)?;
        if !group.members.contains_key(&self.member_id) {
            return Err(BrokerError::StaleMember);
        }
        Ok(group
            .assignments
            .get(&self.member_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn leave(&mut self) -> Result<()> {
        self.remove_from_group();
        Ok(())
    }
}

impl Drop for MemoryMembership {
    fn drop(&mut self) {
        // Dropping without leave() models a crashed member: the group
        // rebalances and uncommitted positions are simply lost.
        if !self.left {
            self.remove_from_group();
        }
    }
}
