//! Partition Worker - Dedicated task for the records of a single partition
//!
//! Each partition gets its own worker with a single-slot channel, so:
//! 1. Records run in arrival order within the partition
//! 2. Partitions run in parallel with each other
//! 3. The poll loop blocks as soon as one record is waiting behind the active one

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::metrics_consts::DISPATCH_RECORDS_DISCARDED;
use crate::runner::HandlerRunner;
use crate::types::{Partition, Record};

/// Records waiting behind the one being handled.
pub const PARTITION_CHANNEL_CAPACITY: usize = 1;

pub struct PartitionWorker {
    partition: Partition,
    sender: mpsc::Sender<Arc<Record>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    pub fn new(partition: Partition, runner: Arc<HandlerRunner>) -> Self {
        let (sender, receiver) = mpsc::channel(PARTITION_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            Self::run_worker(partition.clone(), receiver, runner, cancel.clone())
                .in_current_span(),
        );

        Self {
            partition,
            sender,
            cancel,
            handle: Some(handle),
        }
    }

    /// Clone of the sender so callers can release the dispatcher lock before awaiting.
    pub fn sender(&self) -> mpsc::Sender<Arc<Record>> {
        self.sender.clone()
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Stop accepting records and wait for the worker to exit. Without a prior
    /// [`Self::stop`] the worker drains what it holds first.
    pub async fn shutdown(mut self) {
        drop(self.sender);
        if let Some(handle) = self.handle.take() {
            Self::join_handle(&self.partition, handle).await;
        }
    }

    /// Signal the worker to stop after the record in hand; buffered records are discarded.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn join_handle(partition: &Partition, handle: JoinHandle<()>) {
        match handle.await {
            Ok(()) => debug!("Partition worker for {} shut down", partition),
            Err(e) => warn!("Partition worker for {} failed during shutdown: {}", partition, e),
        }
    }

    async fn run_worker(
        partition: Partition,
        mut receiver: mpsc::Receiver<Arc<Record>>,
        runner: Arc<HandlerRunner>,
        cancel: CancellationToken,
    ) {
        info!("Starting partition worker for {}", partition);

        loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = receiver.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            // a record that reached the handler runs to completion
            runner.run(record).await;
        }

        receiver.close();
        let mut discarded = 0_u64;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            metrics::counter!(DISPATCH_RECORDS_DISCARDED, "group" => runner.group().to_string())
                .increment(discarded);
            info!(
                "Partition worker for {} discarded {} pending records",
                partition, discarded
            );
        }

        info!("Partition worker for {} stopped", partition);
    }
}
