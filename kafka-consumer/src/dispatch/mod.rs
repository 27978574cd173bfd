// Dispatch strategies: how pulled records reach the handler runner
pub mod ordered;
pub mod partition_worker;
pub mod unordered;
pub mod worker_pool;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DispatchError;
use crate::types::{Partition, Record};

pub use ordered::OrderedDispatcher;
pub use unordered::UnorderedDispatcher;

/// Moves records from the poll loop to handler runs.
///
/// `on_assign`, `on_revoke` and `on_message` are only called from the poll loop;
/// `close` may come from any task.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Replace whatever queues exist with fresh ones for `partitions`.
    async fn on_assign(&self, partitions: &[Partition]);

    /// Tear the queues down. Records that have not reached the handler are dropped.
    async fn on_revoke(&self, partitions: &[Partition]);

    /// Hand one record over, waiting while the target queue is full.
    async fn on_message(&self, record: Arc<Record>) -> Result<(), DispatchError>;

    /// Stop for good. `wait` lets in-flight work finish; otherwise pending records
    /// are discarded and nothing is awaited.
    async fn close(&self, wait: bool);
}
