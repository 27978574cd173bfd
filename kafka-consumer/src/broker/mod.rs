// Broker client contract and the rdkafka implementation behind it
pub mod context;
pub mod kafka;

use std::sync::Arc;
use std::time::Duration;

use rdkafka::error::{KafkaError, KafkaResult};

use crate::types::{Partition, PartitionOffset, Record};

pub use context::SubscriberContext;
pub use kafka::KafkaBrokerClient;

/// One outcome of a broker poll.
#[derive(Debug)]
pub enum BrokerEvent {
    Record(Arc<Record>),
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
    Error(KafkaError),
    /// Anything the runtime does not act on; logged and skipped.
    Other(String),
}

/// What the subscriber needs from the underlying Kafka client.
///
/// `poll`, `assign` and `unassign` are only called from the poll-loop thread.
/// `pause`, `resume` and `store_offsets` may be called from any thread and rely
/// on the client's own synchronisation.
pub trait BrokerClient: Send + Sync {
    fn subscribe(&self, topics: &[String]) -> KafkaResult<()>;

    /// Wait up to `timeout` for the next event. `None` means nothing happened.
    fn poll(&self, timeout: Duration) -> Option<BrokerEvent>;

    /// Take ownership of the listed partitions.
    fn assign(&self, partitions: &[Partition]) -> KafkaResult<()>;

    /// Drop ownership of the listed partitions.
    fn unassign(&self, partitions: &[Partition]) -> KafkaResult<()>;

    fn assignment(&self) -> KafkaResult<Vec<Partition>>;

    fn pause(&self, partitions: &[PartitionOffset]) -> KafkaResult<()>;

    fn resume(&self, partitions: &[PartitionOffset]) -> KafkaResult<()>;

    /// Stage offsets for the next commit. The offset given is the next one to deliver,
    /// so "consumed through N" is stored as `N + 1`.
    fn store_offsets(&self, offsets: &[PartitionOffset]) -> KafkaResult<()>;

    /// Synchronously commit everything stored so far.
    fn commit_offsets(&self) -> KafkaResult<()>;

    fn close(&self);
}
