//! Consumer lifecycle states.

/// Where a consumer-group member currently is in its poll loop.
///
/// Tracked for observability; every transition is logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not a member of the group.
    Disconnected,
    /// Join/rebalance in progress.
    Joining,
    /// Waiting for the next batch.
    Polling,
    /// Dispatching a batch to the handler.
    Processing,
    /// Routing a poisoned record to the dead-letter sink.
    DeadLettered,
    /// Committing offsets for fully handled partitions.
    Committing,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Joining => "joining",
            ConsumerState::Polling => "polling",
            ConsumerState::Processing => "processing",
            ConsumerState::DeadLettered => "dead-lettered",
            ConsumerState::Committing => "committing",
        }
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
