//! Unordered dispatch - one bounded queue feeding a shared worker pool
//!
//! The queue is rebuilt on every rebalance; the pool lives as long as the
//! dispatcher. A revoke that leaves partitions owned opens a fresh queue for
//! them. Records of one partition may finish in any order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::dispatch::worker_pool::WorkerPool;
use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::metrics_consts::{
    DISPATCH_BACKPRESSURE_TOTAL, DISPATCH_BACKPRESSURE_WAIT_MS, DISPATCH_RECORDS_DISCARDED,
};
use crate::runner::HandlerRunner;
use crate::types::{Partition, Record};

struct QueueState {
    sender: mpsc::Sender<Arc<Record>>,
    cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

pub struct UnorderedDispatcher {
    runner: Arc<HandlerRunner>,
    pool: Arc<WorkerPool>,
    queue_size: usize,
    queue: RwLock<Option<QueueState>>,
    owned: Mutex<HashSet<Partition>>,
    closed: AtomicBool,
}

impl UnorderedDispatcher {
    pub fn new(runner: Arc<HandlerRunner>, pool_size: usize, queue_size: usize) -> Self {
        Self {
            runner,
            pool: Arc::new(WorkerPool::new(pool_size)),
            queue_size: queue_size.max(1),
            queue: RwLock::new(None),
            owned: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn owned_partitions(&self) -> usize {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn open_queue(&self) -> QueueState {
        let (sender, receiver) = mpsc::channel(self.queue_size);
        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(
            Self::forward(
                receiver,
                self.pool.clone(),
                self.runner.clone(),
                cancel.clone(),
            )
            .in_current_span(),
        );
        QueueState {
            sender,
            cancel,
            forwarder,
        }
    }

    /// Move records from the queue into the pool until the queue closes or is cancelled.
    async fn forward(
        mut receiver: mpsc::Receiver<Arc<Record>>,
        pool: Arc<WorkerPool>,
        runner: Arc<HandlerRunner>,
        cancel: CancellationToken,
    ) {
        debug!("Queue forwarder started");
        loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = receiver.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            let submitted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                submitted = pool.submit(runner.clone(), record) => submitted,
            };
            if submitted.is_err() {
                warn!("Worker pool closed, queue forwarder stopping");
                break;
            }
        }

        receiver.close();
        let mut discarded = 0_u64;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            metrics::counter!(DISPATCH_RECORDS_DISCARDED, "group" => runner.group().to_string())
                .increment(discarded);
            info!("Queue forwarder discarded {} pending records", discarded);
        }
        debug!("Queue forwarder stopped");
    }

    /// Close the current queue and let the forwarder hand what it holds to the pool.
    async fn retire_queue(&self) {
        let state = self.queue.write().await.take();
        if let Some(QueueState {
            sender, forwarder, ..
        }) = state
        {
            drop(sender);
            if let Err(e) = forwarder.await {
                warn!("Queue forwarder failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl Dispatcher for UnorderedDispatcher {
    async fn on_assign(&self, partitions: &[Partition]) {
        self.retire_queue().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let owned = {
            let mut owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
            owned.extend(partitions.iter().cloned());
            owned.len()
        };
        info!(
            "Opening record queue (capacity {}) for {} partitions",
            self.queue_size, owned
        );
        *self.queue.write().await = Some(self.open_queue());
    }

    async fn on_revoke(&self, partitions: &[Partition]) {
        self.retire_queue().await;

        let remaining = {
            let mut owned = self.owned.lock().unwrap_or_else(PoisonError::into_inner);
            for partition in partitions {
                owned.remove(partition);
            }
            owned.len()
        };
        if remaining == 0 || self.closed.load(Ordering::SeqCst) {
            return;
        }

        info!(
            "Reopening record queue (capacity {}) for {} retained partitions",
            self.queue_size, remaining
        );
        *self.queue.write().await = Some(self.open_queue());
    }

    async fn on_message(&self, record: Arc<Record>) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }
        let sender = {
            let queue = self.queue.read().await;
            queue
                .as_ref()
                .map(|state| state.sender.clone())
                .ok_or(DispatchError::NoQueue)?
        };

        let send_start = if sender.capacity() == 0 {
            metrics::counter!(DISPATCH_BACKPRESSURE_TOTAL, "group" => self.runner.group().to_string())
                .increment(1);
            Some(Instant::now())
        } else {
            None
        };

        let result = sender.send(record).await.map_err(|_| DispatchError::NoQueue);

        if let Some(start) = send_start {
            metrics::histogram!(DISPATCH_BACKPRESSURE_WAIT_MS, "group" => self.runner.group().to_string())
                .record(start.elapsed().as_millis() as f64);
        }

        result
    }

    async fn close(&self, wait: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "Closing unordered dispatcher with {} runs in flight (wait: {})",
            self.pool.in_flight(),
            wait
        );

        if wait {
            self.retire_queue().await;
            self.pool.drain().await;
        } else {
            if let Some(state) = self.queue.write().await.take() {
                state.cancel.cancel();
            }
            self.pool.close();
        }
    }
}
