//! Ordered dispatch - one worker per assigned partition
//!
//! Workers are created during assignment and removed during revocation. Both only
//! touch the listed partitions, so under incremental rebalancing the workers of
//! retained partitions keep running. Routing only sends to existing workers; a
//! record for a partition without a worker is an error the poll loop reports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::dispatch::partition_worker::PartitionWorker;
use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::metrics_consts::{DISPATCH_BACKPRESSURE_TOTAL, DISPATCH_BACKPRESSURE_WAIT_MS};
use crate::runner::HandlerRunner;
use crate::types::{Partition, Record};

pub struct OrderedDispatcher {
    runner: Arc<HandlerRunner>,
    workers: RwLock<HashMap<Partition, PartitionWorker>>,
    closed: AtomicBool,
}

impl OrderedDispatcher {
    pub fn new(runner: Arc<HandlerRunner>) -> Self {
        Self {
            runner,
            workers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn active_partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self.workers.read().await.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Take the workers of `partitions` out of the map, stop them, and wait for the records in hand.
    async fn stop_workers(&self, partitions: &[Partition]) {
        let workers: Vec<PartitionWorker> = {
            let mut map = self.workers.write().await;
            partitions.iter().filter_map(|p| map.remove(p)).collect()
        };
        if workers.is_empty() {
            return;
        }

        info!("Stopping {} partition workers", workers.len());
        for worker in &workers {
            worker.stop();
        }
        join_all(workers.into_iter().map(PartitionWorker::shutdown)).await;
    }

    async fn sender_for(
        &self,
        partition: &Partition,
    ) -> Result<mpsc::Sender<Arc<Record>>, DispatchError> {
        let workers = self.workers.read().await;
        workers
            .get(partition)
            .map(PartitionWorker::sender)
            .ok_or_else(|| DispatchError::NoPartitionWorker(partition.clone()))
        // read guard released here, before any send is awaited
    }
}

#[async_trait]
impl Dispatcher for OrderedDispatcher {
    async fn on_assign(&self, partitions: &[Partition]) {
        // a partition assigned again starts over with a fresh worker
        self.stop_workers(partitions).await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.write().await;
        for partition in partitions {
            info!("Creating partition worker for {}", partition);
            workers.insert(
                partition.clone(),
                PartitionWorker::new(partition.clone(), self.runner.clone()),
            );
        }
    }

    async fn on_revoke(&self, partitions: &[Partition]) {
        self.stop_workers(partitions).await;
    }

    async fn on_message(&self, record: Arc<Record>) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::Closed);
        }
        let partition = record.partition().clone();
        let sender = self.sender_for(&partition).await?;

        let send_start = if sender.capacity() == 0 {
            metrics::counter!(
                DISPATCH_BACKPRESSURE_TOTAL,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
            Some(Instant::now())
        } else {
            None
        };

        let result = sender
            .send(record)
            .await
            .map_err(|_| DispatchError::WorkerStopped(partition.clone()));

        if let Some(start) = send_start {
            metrics::histogram!(
                DISPATCH_BACKPRESSURE_WAIT_MS,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .record(start.elapsed().as_millis() as f64);
        }

        result
    }

    async fn close(&self, wait: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let workers: Vec<PartitionWorker> = {
            let mut map = self.workers.write().await;
            map.drain().map(|(_, worker)| worker).collect()
        };
        info!(
            "Closing ordered dispatcher with {} workers (wait: {})",
            workers.len(),
            wait
        );

        if wait {
            join_all(workers.into_iter().map(PartitionWorker::shutdown)).await;
        } else {
            for worker in &workers {
                worker.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriberConfig;
    use crate::offsets::{OffsetMarker, OnCompletionCommitter};
    use crate::pause::{PartitionController, PauseRegistry};
    use crate::test_utils::{test_record, GatedHandler, MockBroker, RecordingHandler};
    use std::time::Duration;

    fn dispatcher(config: SubscriberConfig) -> (Arc<MockBroker>, OrderedDispatcher) {
        let broker = Arc::new(MockBroker::new());
        let offsets = Arc::new(OnCompletionCommitter::new(OffsetMarker::new(
            broker.clone(),
            "group".to_string(),
        )));
        let controller = PartitionController::new(Arc::new(PauseRegistry::new(
            broker.clone(),
            "group".to_string(),
        )));
        let runner = Arc::new(HandlerRunner::new(
            &config,
            config.record_handler().unwrap(),
            offsets,
            controller,
        ));
        (broker, OrderedDispatcher::new(runner))
    }

    fn config() -> SubscriberConfig {
        SubscriberConfig::new(["localhost:9092"], "group", ["events"])
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_preserves_order_per_partition() {
        let handler = Arc::new(RecordingHandler::new());
        let (_broker, dispatcher) = dispatcher(config().with_handler(handler.clone()));
        let p0 = Partition::new("events", 0);
        let p1 = Partition::new("events", 1);
        dispatcher.on_assign(&[p0.clone(), p1.clone()]).await;

        for offset in 0..20 {
            dispatcher.on_message(test_record("events", 0, offset)).await.unwrap();
            dispatcher.on_message(test_record("events", 1, offset)).await.unwrap();
        }
        dispatcher.close(true).await;

        let expected: Vec<i64> = (0..20).collect();
        assert_eq!(handler.handled_for(&p0), expected);
        assert_eq!(handler.handled_for(&p1), expected);
    }

    #[tokio::test]
    async fn test_unknown_partition_is_an_error() {
        let (_broker, dispatcher) = dispatcher(config().with_handler(Arc::new(RecordingHandler::new())));
        dispatcher.on_assign(&[Partition::new("events", 0)]).await;

        let err = dispatcher
            .on_message(test_record("events", 5, 1))
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::NoPartitionWorker(Partition::new("events", 5)));
    }

    #[tokio::test]
    async fn test_incremental_assign_keeps_retained_workers() {
        let (_broker, dispatcher) = dispatcher(config().with_handler(Arc::new(RecordingHandler::new())));
        dispatcher
            .on_assign(&[Partition::new("events", 0), Partition::new("events", 1)])
            .await;
        dispatcher
            .on_assign(&[Partition::new("events", 1), Partition::new("events", 2)])
            .await;

        assert_eq!(
            dispatcher.active_partitions().await,
            vec![
                Partition::new("events", 0),
                Partition::new("events", 1),
                Partition::new("events", 2)
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_partial_revoke_leaves_other_partitions_running() {
        let handler = Arc::new(RecordingHandler::new());
        let (_broker, dispatcher) = dispatcher(config().with_handler(handler.clone()));
        let p0 = Partition::new("events", 0);
        let p1 = Partition::new("events", 1);
        dispatcher.on_assign(&[p0.clone(), p1.clone()]).await;

        dispatcher.on_revoke(&[p0.clone()]).await;

        assert_eq!(dispatcher.active_partitions().await, vec![p1.clone()]);
        assert_eq!(
            dispatcher.on_message(test_record("events", 0, 1)).await,
            Err(DispatchError::NoPartitionWorker(p0))
        );
        for offset in 0..3 {
            dispatcher.on_message(test_record("events", 1, offset)).await.unwrap();
        }
        dispatcher.close(true).await;
        assert_eq!(handler.handled_for(&p1), vec![0, 1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_revoke_mid_flight_discards_pending() {
        let handler = Arc::new(GatedHandler::new());
        let (broker, dispatcher) = dispatcher(config().with_handler(handler.clone()));
        let dispatcher = Arc::new(dispatcher);
        let p0 = Partition::new("events", 0);
        dispatcher.on_assign(&[p0.clone()]).await;

        dispatcher.on_message(test_record("events", 0, 42)).await.unwrap();
        wait_for(|| handler.started() == 1).await;
        dispatcher.on_message(test_record("events", 0, 43)).await.unwrap();

        let revoking = {
            let dispatcher = dispatcher.clone();
            let p0 = p0.clone();
            tokio::spawn(async move { dispatcher.on_revoke(&[p0]).await })
        };
        // the worker has observed the stop before the in-flight record finishes
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.release(10);
        revoking.await.unwrap();

        assert_eq!(handler.finished_offsets(), vec![(p0.clone(), 42)]);
        assert_eq!(broker.stored_offsets_for(&p0), vec![43]);
        assert_eq!(
            dispatcher.on_message(test_record("events", 0, 44)).await,
            Err(DispatchError::NoPartitionWorker(p0))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_record_backpressure() {
        let handler = Arc::new(GatedHandler::new());
        let (_broker, dispatcher) = dispatcher(config().with_handler(handler.clone()));
        let dispatcher = Arc::new(dispatcher);
        dispatcher.on_assign(&[Partition::new("events", 0)]).await;

        let producer = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                for offset in 0..10 {
                    dispatcher.on_message(test_record("events", 0, offset)).await.unwrap();
                }
            })
        };

        wait_for(|| handler.started() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // one record in the handler, one in the slot, the producer parked on the third
        assert_eq!(handler.started(), 1);
        assert!(!producer.is_finished());

        handler.release(10);
        producer.await.unwrap();
        dispatcher.close(true).await;
        assert_eq!(handler.finished_offsets().len(), 10);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_records() {
        let (_broker, dispatcher) = dispatcher(config().with_handler(Arc::new(RecordingHandler::new())));
        dispatcher.on_assign(&[Partition::new("events", 0)]).await;

        dispatcher.close(false).await;
        dispatcher.close(true).await;

        assert_eq!(
            dispatcher.on_message(test_record("events", 0, 1)).await,
            Err(DispatchError::Closed)
        );
        dispatcher.on_assign(&[Partition::new("events", 0)]).await;
        assert!(dispatcher.active_partitions().await.is_empty());
    }
}
