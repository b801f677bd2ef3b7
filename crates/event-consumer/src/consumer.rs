//! Consumer-group member poll loop.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use broker_client::{Broker, BrokerError, FetchedRecord, RetryPolicy};
use event_types::Envelope;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dead_letter::DeadLetterSink;
use crate::error::{ConsumerError, HandlerError};
use crate::state::ConsumerState;

/// Consumer tuning knobs.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group_id: String,
    pub dead_letter_topic: String,
    /// Maximum records fetched per poll. Larger batches improve throughput
    /// but widen the redelivery window on a crash.
    pub batch_size: usize,
    pub poll_timeout: Duration,
    /// Retry budget for handler failures before a record is dead-lettered.
    pub handler_retry: RetryPolicy,
    /// Backoff between group re-join attempts.
    pub rejoin_retry: RetryPolicy,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            dead_letter_topic: format!("{topic}-dlq"),
            topic,
            group_id: group_id.into(),
            batch_size: 100,
            poll_timeout: Duration::from_secs(1),
            handler_retry: RetryPolicy::new(3, Duration::from_millis(50), 2.0, Duration::from_secs(1)),
            rejoin_retry: RetryPolicy::default(),
        }
    }
}

/// What happened to one partition's slice of a batch.
struct PartitionOutcome {
    /// Next offset to commit, if any record was handled.
    next_offset: Option<i64>,
    /// The cancellation token fired mid-slice; finish commits and shut down.
    cancelled: bool,
}

/// One consumer-group member.
///
/// [`run`](Self::run) owns its execution context: spawn one task per member.
pub struct Consumer {
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    state: ConsumerState,
}

impl Consumer {
    pub fn new(broker: Arc<dyn Broker>, config: ConsumerConfig) -> Self {
        Self {
            broker,
            config,
            state: ConsumerState::Disconnected,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Run the poll loop until the token is cancelled.
    ///
    /// The handler is invoked once per envelope, in offset order within each
    /// partition. A handler error is retried per the configured budget, then
    /// the record is dead-lettered and the loop continues. Offsets are
    /// committed per partition after its slice of the batch is fully
    /// handled; partitions revoked by a rebalance in the meantime are not
    /// committed.
    pub async fn run<H>(&mut self, mut handler: H, cancel: CancellationToken) -> Result<(), ConsumerError>
    where
        H: FnMut(&Envelope) -> Result<(), HandlerError> + Send,
    {
        let sink = DeadLetterSink::new(Arc::clone(&self.broker), self.config.dead_letter_topic.clone());
        sink.ensure().await?;

        let mut join_failures = 0u32;
        'session: loop {
            if cancel.is_cancelled() {
                self.transition(ConsumerState::Disconnected);
                return Ok(());
            }
            self.transition(ConsumerState::Joining);
            let joined = tokio::select! {
                _ = cancel.cancelled() => None,
                joined = self
                    .broker
                    .join_group(&self.config.group_id, std::slice::from_ref(&self.config.topic)) => Some(joined),
            };
            let Some(joined) = joined else {
                self.transition(ConsumerState::Disconnected);
                return Ok(());
            };
            let mut membership = match joined {
                Ok(membership) => {
                    join_failures = 0;
                    info!(group = %self.config.group_id, topic = %self.config.topic, "joined consumer group");
                    membership
                }
                Err(BrokerError::Closed) => {
                    self.transition(ConsumerState::Disconnected);
                    return Err(BrokerError::Closed.into());
                }
                Err(err) => {
                    self.transition(ConsumerState::Disconnected);
                    let rebalance = ConsumerError::Rebalance {
                        group: self.config.group_id.clone(),
                        message: err.to_string(),
                    };
                    let delay = self.config.rejoin_retry.delay_for(join_failures);
                    join_failures = join_failures.saturating_add(1);
                    warn!("{rebalance}, retrying in {delay:?}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue 'session;
                }
            };

            loop {
                self.transition(ConsumerState::Polling);
                let polled = tokio::select! {
                    _ = cancel.cancelled() => None,
                    polled = membership.poll(self.config.batch_size, self.config.poll_timeout) => Some(polled),
                };
                let Some(polled) = polled else {
                    let _ = membership.leave().await;
                    self.transition(ConsumerState::Disconnected);
                    return Ok(());
                };
                let batch = match polled {
                    Ok(batch) => batch,
                    Err(BrokerError::StaleMember) => {
                        warn!(group = %self.config.group_id, "lost group membership, rejoining");
                        continue 'session;
                    }
                    Err(BrokerError::Closed) => {
                        self.transition(ConsumerState::Disconnected);
                        return Err(BrokerError::Closed.into());
                    }
                    Err(err) => {
                        warn!("poll failed: {err}");
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                let _ = membership.leave().await;
                                self.transition(ConsumerState::Disconnected);
                                return Ok(());
                            }
                            _ = tokio::time::sleep(self.config.rejoin_retry.base_delay) => {}
                        }
                        continue;
                    }
                };
                if batch.is_empty() {
                    continue;
                }

                self.transition(ConsumerState::Processing);
                let mut by_partition: BTreeMap<i32, Vec<FetchedRecord>> = BTreeMap::new();
                for record in batch {
                    by_partition.entry(record.partition).or_default().push(record);
                }

                let mut commits: Vec<(i32, i64)> = Vec::new();
                let mut cancelled = false;
                for (partition, records) in &by_partition {
                    let outcome = self
                        .process_partition(records, &mut handler, &sink, &cancel)
                        .await;
                    if let Some(next_offset) = outcome.next_offset {
                        commits.push((*partition, next_offset));
                    }
                    if outcome.cancelled {
                        cancelled = true;
                        break;
                    }
                }

                if !commits.is_empty() {
                    self.transition(ConsumerState::Committing);
                    match self.commit_partitions(&mut *membership, &commits).await {
                        CommitResult::Ok => {}
                        CommitResult::Rejoin => continue 'session,
                    }
                }

                if cancelled {
                    let _ = membership.leave().await;
                    self.transition(ConsumerState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    /// Dispatch one partition's slice of a batch, in offset order.
    async fn process_partition<H>(
        &mut self,
        records: &[FetchedRecord],
        handler: &mut H,
        sink: &DeadLetterSink,
        cancel: &CancellationToken,
    ) -> PartitionOutcome
    where
        H: FnMut(&Envelope) -> Result<(), HandlerError> + Send,
    {
        let mut next_offset = None;
        for record in records {
            let envelope = match Envelope::from_bytes(&record.payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    // Malformed records are never fatal and never retried.
                    warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "undecodable record: {err}"
                    );
                    self.transition(ConsumerState::DeadLettered);
                    if let Err(route_err) = sink.route(record, &format!("decode failed: {err}")).await {
                        warn!("{route_err}; leaving offset uncommitted for redelivery");
                        return PartitionOutcome { next_offset, cancelled: false };
                    }
                    self.transition(ConsumerState::Processing);
                    next_offset = Some(record.offset + 1);
                    continue;
                }
            };

            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match handler(&envelope) {
                    Ok(()) => break,
                    Err(err) if attempt < self.config.handler_retry.max_attempts => {
                        let delay = self.config.handler_retry.delay_for(attempt - 1);
                        warn!(
                            id = %envelope.id,
                            attempt,
                            "handler failed: {err}, retrying in {delay:?}"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return PartitionOutcome { next_offset, cancelled: true };
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(err) => {
                        warn!(
                            id = %envelope.id,
                            attempts = attempt,
                            "handler retries exhausted: {err}, dead-lettering"
                        );
                        self.transition(ConsumerState::DeadLettered);
                        if let Err(route_err) =
                            sink.route(record, &format!("handler failed after {attempt} attempts: {err}")).await
                        {
                            warn!("{route_err}; leaving offset uncommitted for redelivery");
                            return PartitionOutcome { next_offset, cancelled: false };
                        }
                        self.transition(ConsumerState::Processing);
                        break;
                    }
                }
            }
            next_offset = Some(record.offset + 1);
        }
        PartitionOutcome { next_offset, cancelled: false }
    }

    /// Commit fully handled partitions, skipping any revoked in the
    /// meantime.
    async fn commit_partitions(
        &mut self,
        membership: &mut dyn broker_client::GroupMembership,
        commits: &[(i32, i64)],
    ) -> CommitResult {
        let assigned: HashSet<i32> = match membership.assignment().await {
            Ok(assignment) => assignment
                .into_iter()
                .filter(|tp| tp.topic == self.config.topic)
                .map(|tp| tp.partition)
                .collect(),
            Err(err) => {
                warn!("assignment lookup failed before commit: {err}, rejoining");
                return CommitResult::Rejoin;
            }
        };

        for (partition, next_offset) in commits {
            if !assigned.contains(partition) {
                warn!(partition, "partition revoked during processing, skipping commit");
                continue;
            }
            match membership.commit(&self.config.topic, *partition, *next_offset).await {
                Ok(()) => debug!(partition, next_offset, "offsets committed"),
                Err(BrokerError::StaleMember) => {
                    warn!(partition, "commit rejected by rebalance, rejoining");
                    return CommitResult::Rejoin;
                }
                Err(err) => {
                    // Uncommitted work is redelivered; nothing is lost.
                    warn!(partition, "commit failed: {err}");
                }
            }
        }
        CommitResult::Ok
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state != next {
            debug!(from = self.state.as_str(), to = next.as_str(), "consumer state change");
            self.state = next;
        }
    }
}

enum CommitResult {
    Ok,
    Rejoin,
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_client::{MemoryBroker, Record};
    use std::sync::Mutex;

    fn test_config(topic: &str, group: &str) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(topic, group);
        config.poll_timeout = Duration::from_millis(50);
        config.handler_retry =
            RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(5));
        config
    }

    fn envelope_bytes(id: &str) -> Vec<u8> {
        Envelope::builder()
            .id(id)
            .source("https://cloudstream/producer")
            .event_type("io.cloudstream.producer")
            .json_data(&serde_json::json!({"id": id}))
            .unwrap()
            .build()
            .unwrap()
            .to_bytes()
            .unwrap()
    }

    async fn append_envelope(broker: &MemoryBroker, topic: &str, partition: i32, id: &str) {
        broker
            .append(topic, partition, Record::new(envelope_bytes(id)))
            .await
            .unwrap();
    }

    /// Handler that records envelope ids and cancels the token once `stop_at`
    /// envelopes were seen.
    fn counting_handler(
        seen: Arc<Mutex<Vec<String>>>,
        cancel: CancellationToken,
        stop_at: usize,
    ) -> impl FnMut(&Envelope) -> Result<(), HandlerError> + Send {
        move |envelope: &Envelope| {
            let mut seen = seen.lock().unwrap();
            seen.push(envelope.id.clone());
            if seen.len() >= stop_at {
                cancel.cancel();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_envelopes_are_handled_in_partition_order() {
        let broker = MemoryBroker::new();
        broker.ensure_topic("events", 1).await.unwrap();
        for id in ["o1", "o2", "o3"] {
            append_envelope(&broker, "events", 0, id).await;
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let mut consumer = Consumer::new(
            Arc::new(broker.clone()),
            test_config("events", "test-group"),
        );
        consumer
            .run(counting_handler(Arc::clone(&seen), cancel.clone(), 3), cancel)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["o1", "o2", "o3"]);
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
    }

    #[tokio::test]
    async fn test_offsets_commit_only_after_handling() {
        let broker = MemoryBroker::new();
        broker.ensure_topic("events", 1).await.unwrap();
        for id in ["a", "b"] {
            append_envelope(&broker, "events", 0, id).await;
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let mut consumer = Consumer::new(
            Arc::new(broker.clone()),
            test_config("events", "test-group"),
        );
        consumer
            .run(counting_handler(Arc::clone(&seen), cancel.clone(), 2), cancel)
            .await
            .unwrap();

        // A fresh member of the same group starts past the committed batch.
        let mut membership = broker
            .join_group("test-group", &["events".to_string()])
            .await
            .unwrap();
        let redelivered = membership.poll(10, Duration::from_millis(50)).await.unwrap();
        assert!(redelivered.is_empty(), "everything handled must be committed");
    }

    #[tokio::test]
    async fn test_poison_record_is_dead_lettered_once_and_isolated() {
        let broker = MemoryBroker::new();
        broker.ensure_topic("events", 1).await.unwrap();
        append_envelope(&broker, "events", 0, "poison").await;
        append_envelope(&broker, "events", 0, "good").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let handler = {
            let seen = Arc::clone(&seen);
            let cancel = cancel.clone();
            move |envelope: &Envelope| {
                if envelope.id == "poison" {
                    return Err(HandlerError::msg("cannot process"));
                }
                seen.lock().unwrap().push(envelope.id.clone());
                cancel.cancel();
                Ok(())
            }
        };

        let config = test_config("events", "test-group");
        let dead_letter_topic = config.dead_letter_topic.clone();
        let mut consumer = Consumer::new(Arc::new(broker.clone()), config);
        consumer.run(handler, cancel).await.unwrap();

        // The failing record did not block the good one.
        assert_eq!(*seen.lock().unwrap(), vec!["good"]);

        // Exactly one dead-lettered copy, with failure metadata attached.
        let dead = broker.fetch_from(&dead_letter_topic, 0, 0).unwrap();
        assert_eq!(dead.len(), 1);
        let envelope = Envelope::from_bytes(&dead[0].payload).unwrap();
        assert_eq!(envelope.id, "poison");
        assert!(dead[0]
            .header(crate::dead_letter::headers::ERROR)
            .unwrap()
            .contains("3 attempts"));
        assert_eq!(
            dead[0].header(crate::dead_letter::headers::SOURCE_OFFSET),
            Some("0")
        );
    }

    #[tokio::test]
    async fn test_undecodable_record_is_dead_lettered_not_fatal() {
        let broker = MemoryBroker::new();
        broker.ensure_topic("events", 1).await.unwrap();
        broker
            .append("events", 0, Record::new(b"{not json".to_vec()))
            .await
            .unwrap();
        append_envelope(&broker, "events", 0, "good").await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let config = test_config("events", "test-group");
        let dead_letter_topic = config.dead_letter_topic.clone();
        let mut consumer = Consumer::new(Arc::new(broker.clone()), config);
        consumer
            .run(counting_handler(Arc::clone(&seen), cancel.clone(), 1), cancel)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["good"]);
        let dead = broker.fetch_from(&dead_letter_topic, 0, 0).unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0]
            .header(crate::dead_letter::headers::ERROR)
            .unwrap()
            .starts_with("decode failed"));
    }

    #[tokio::test]
    async fn test_cancel_during_handler_backoff_preserves_at_least_once() {
        let broker = MemoryBroker::new();
        broker.ensure_topic("events", 1).await.unwrap();
        append_envelope(&broker, "events", 0, "first").await;
        append_envelope(&broker, "events", 0, "second").await;

        // Handles "first", then keeps failing on "second" until the token is
        // cancelled during the retry backoff (a shutdown mid-record).
        let cancel = CancellationToken::new();
        let handler = {
            let cancel = cancel.clone();
            move |envelope: &Envelope| {
                if envelope.id == "second" {
                    cancel.cancel();
                    return Err(HandlerError::msg("interrupted"));
                }
                Ok(())
            }
        };

        let mut config = test_config("events", "test-group");
        config.handler_retry =
            RetryPolicy::new(5, Duration::from_millis(20), 2.0, Duration::from_millis(100));
        let mut consumer = Consumer::new(Arc::new(broker.clone()), config);
        consumer.run(handler, cancel).await.unwrap();

        // "first" was handled and committed; "second" must be redelivered to
        // the next member of the group.
        let mut membership = broker
            .join_group("test-group", &["events".to_string()])
            .await
            .unwrap();
        let redelivered = membership.poll(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        let envelope = Envelope::from_bytes(&redelivered[0].payload).unwrap();
        assert_eq!(envelope.id, "second");
    }
}
