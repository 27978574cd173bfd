// Offset commit strategies
pub mod on_completion;
pub mod on_pull;

use std::sync::Arc;

use rdkafka::error::KafkaResult;
use tracing::debug;

use crate::broker::BrokerClient;
use crate::metrics_consts::{OFFSETS_MARKED, OFFSET_STORE_FAILURES};
use crate::types::{Partition, PartitionOffset, Record};

pub use on_completion::OnCompletionCommitter;
pub use on_pull::OnPullCommitter;

/// Commit policy hooks, called by the poll loop and the handler runner.
pub trait OffsetManager: Send + Sync {
    /// A record was taken off the broker.
    fn on_pull(&self, record: &Record);

    /// The runner is about to hand `offset` to the handler.
    fn before_handler(&self, partition: &Partition, offset: i64);

    /// The runner is done with `offset`, whatever the outcome.
    fn after_handler(&self, partition: &Partition, offset: i64);

    fn on_assign(&self, _partitions: &[Partition]) {}

    fn on_revoke(&self, _partitions: &[Partition]) {}
}

/// Stages offsets in the broker client's local store; the client flushes them on
/// its commit interval.
#[derive(Clone)]
pub struct OffsetMarker {
    broker: Arc<dyn BrokerClient>,
    group: String,
}

impl OffsetMarker {
    pub fn new(broker: Arc<dyn BrokerClient>, group: String) -> Self {
        Self { broker, group }
    }

    /// Declare `partition` consumed through `offset` (stores `offset + 1`).
    pub fn mark(&self, partition: &Partition, offset: i64) -> KafkaResult<()> {
        self.broker
            .store_offsets(&[PartitionOffset::new(partition.clone(), offset + 1)])?;
        metrics::counter!(OFFSETS_MARKED, "group" => self.group.clone()).increment(1);
        Ok(())
    }

    /// [`Self::mark`] for commit strategies: failures are only logged, the next
    /// mark or commit interval catches up.
    pub(crate) fn mark_logged(&self, partition: &Partition, offset: i64) {
        if let Err(e) = self.mark(partition, offset) {
            metrics::counter!(OFFSET_STORE_FAILURES, "group" => self.group.clone()).increment(1);
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                error = %e,
                "Failed to store offset"
            );
        }
    }
}
