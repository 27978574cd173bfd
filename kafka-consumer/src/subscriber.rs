//! Subscriber - owns the broker client and runs the single poll loop
//!
//! The loop runs on a blocking thread and drives every event to completion on
//! the runtime before polling again, so assign, unassign and dispatch never
//! interleave. Pause, resume, offset marks and health are safe from any task.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::broker::{BrokerClient, BrokerEvent, KafkaBrokerClient};
use crate::config::{CommitMode, ConsumerMode, SubscriberConfig};
use crate::dispatch::{Dispatcher, OrderedDispatcher, UnorderedDispatcher};
use crate::error::{is_all_brokers_down, ConfigError, ConsumerError, DispatchError, SubscriberError};
use crate::health::{HealthSnapshot, HealthState};
use crate::metrics_consts::{BROKER_ERRORS, DISPATCH_ERRORS, REBALANCE_EVENTS, RECORDS_RECEIVED};
use crate::offsets::{OffsetManager, OffsetMarker, OnCompletionCommitter, OnPullCommitter};
use crate::pause::{PartitionController, PauseRegistry};
use crate::runner::HandlerRunner;
use crate::types::{Partition, Record};

/// A consumer-group member that feeds records to the configured handler.
///
/// Cheap to clone; clones share the same poll loop.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

struct SubscriberInner {
    config: SubscriberConfig,
    broker: Arc<dyn BrokerClient>,
    dispatcher: Arc<dyn Dispatcher>,
    offsets: Arc<dyn OffsetManager>,
    runner: Arc<HandlerRunner>,
    marker: OffsetMarker,
    pauses: Arc<PauseRegistry>,
    health: HealthState,
    assignment: Mutex<BTreeSet<Partition>>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    span: Span,
}

impl Subscriber {
    /// Validate `config` and connect an rdkafka consumer. Nothing is polled until [`Self::start`].
    pub fn new(config: SubscriberConfig) -> Result<Self, SubscriberError> {
        config.validate()?;
        let broker = KafkaBrokerClient::new(&config.to_client_config())?;
        Self::with_broker(config, Arc::new(broker))
    }

    /// Build a subscriber on top of any [`BrokerClient`].
    pub fn with_broker(
        config: SubscriberConfig,
        broker: Arc<dyn BrokerClient>,
    ) -> Result<Self, SubscriberError> {
        config.validate()?;
        let handler = config.record_handler().ok_or(ConfigError::MissingHandler)?;

        let marker = OffsetMarker::new(broker.clone(), config.group.clone());
        let offsets: Arc<dyn OffsetManager> = match config.commit_mode {
            CommitMode::OnPull => Arc::new(OnPullCommitter::new(marker.clone())),
            CommitMode::OnCompletion => Arc::new(OnCompletionCommitter::new(marker.clone())),
        };
        let pauses = Arc::new(PauseRegistry::new(broker.clone(), config.group.clone()));
        let runner = Arc::new(HandlerRunner::new(
            &config,
            handler,
            offsets.clone(),
            PartitionController::new(pauses.clone()),
        ));
        let dispatcher: Arc<dyn Dispatcher> = match config.consumer_mode {
            ConsumerMode::Ordered => Arc::new(OrderedDispatcher::new(runner.clone())),
            ConsumerMode::Unordered => Arc::new(UnorderedDispatcher::new(
                runner.clone(),
                config.worker_pool_size(),
                config.max_queue_size,
            )),
        };

        let health = HealthState::new(
            config.group.clone(),
            config.topics.clone(),
            config.brokers.clone(),
        );
        let span = info_span!(
            "kafka_subscriber",
            group = %config.group,
            topics = ?config.topics
        );

        info!(
            group = %config.group,
            topics = ?config.topics,
            commit_mode = %config.commit_mode,
            consumer_mode = %config.consumer_mode,
            "Created subscriber"
        );

        Ok(Self {
            inner: Arc::new(SubscriberInner {
                config,
                broker,
                dispatcher,
                offsets,
                runner,
                marker,
                pauses,
                health,
                assignment: Mutex::new(BTreeSet::new()),
                shutdown: CancellationToken::new(),
                stopped: CancellationToken::new(),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                span,
            }),
        })
    }

    /// Subscribe and poll until [`Self::close`] is called. Resolves once the poll loop has exited.
    pub async fn start(&self) -> Result<(), SubscriberError> {
        let inner = self.inner.clone();
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(SubscriberError::AlreadyStarted);
        }
        // marks the loop as stopped on every exit path, including early returns
        let stopped = inner.stopped.clone().drop_guard();
        if inner.closed.load(Ordering::SeqCst) {
            return Err(SubscriberError::Closed);
        }

        inner.broker.subscribe(&inner.config.topics)?;
        info!(parent: &inner.span, topics = ?inner.config.topics, "Subscribed");

        let handle = Handle::current();
        tokio::task::spawn_blocking(move || {
            let _stopped = stopped;
            inner.poll_loop(&handle);
        })
        .await
        .map_err(|e| SubscriberError::PollLoop(e.to_string()))
    }

    /// Stop polling and shut the dispatch strategy down. With `wait`, records
    /// already handed out finish first; otherwise pending records are dropped.
    /// A second call does nothing.
    pub async fn close(&self, wait: bool) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(parent: &inner.span, wait = wait, "Closing subscriber");

        inner.shutdown.cancel();
        if inner.started.load(Ordering::SeqCst) {
            inner.stopped.cancelled().await;
        }

        inner
            .dispatcher
            .close(wait)
            .instrument(inner.span.clone())
            .await;

        if let Err(e) = inner.broker.commit_offsets() {
            debug!(parent: &inner.span, error = %e, "Final offset commit failed");
        }
        inner.broker.close();
        inner.health.mark_disconnected();
        inner.runner.notify("subscriber closed");
        info!(parent: &inner.span, "Subscriber closed");
    }

    pub fn health(&self) -> HealthSnapshot {
        self.inner.health.snapshot()
    }

    /// Declare `topic`/`partition` consumed through `offset`.
    pub fn mark_offset(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(), SubscriberError> {
        self.inner
            .marker
            .mark(&Partition::new(topic, partition), offset)?;
        Ok(())
    }

    pub fn pause(&self, topic: &str, partition: i32, offset: i64) -> Result<(), SubscriberError> {
        self.inner
            .pauses
            .pause(Partition::new(topic, partition), offset)?;
        Ok(())
    }

    pub fn resume(&self, topic: &str, partition: i32, offset: i64) -> Result<(), SubscriberError> {
        self.inner
            .pauses
            .resume(Partition::new(topic, partition), offset)?;
        Ok(())
    }

    pub fn pause_all(&self) -> Result<(), SubscriberError> {
        self.inner.pauses.pause_all()?;
        Ok(())
    }

    pub fn resume_all(&self) -> Result<(), SubscriberError> {
        self.inner.pauses.resume_all()?;
        Ok(())
    }

    /// Partitions currently owned, in order.
    pub fn assignment(&self) -> Vec<Partition> {
        self.inner.assignment().iter().cloned().collect()
    }

    /// Paused partitions with the offset each resumes from.
    pub fn paused(&self) -> HashMap<Partition, i64> {
        self.inner.pauses.paused()
    }

    pub fn controller(&self) -> PartitionController {
        PartitionController::new(self.inner.pauses.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl SubscriberInner {
    fn assignment(&self) -> MutexGuard<'_, BTreeSet<Partition>> {
        self.assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_loop(&self, handle: &Handle) {
        let _entered = self.span.enter();
        info!("Poll loop started");

        while !self.shutdown.is_cancelled() {
            // nothing assigned yet, so nothing to hurry for
            let timeout = if self.assignment().is_empty() {
                self.config.empty_queue_wait
            } else {
                self.config.poll_timeout
            };

            let Some(event) = self.broker.poll(timeout) else {
                continue;
            };
            handle.block_on(self.handle_event(event).instrument(self.span.clone()));
        }

        info!("Poll loop stopped");
    }

    async fn handle_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Record(record) => self.handle_record(record).await,
            BrokerEvent::Assigned(partitions) => self.handle_assigned(partitions).await,
            BrokerEvent::Revoked(partitions) => self.handle_revoked(partitions).await,
            BrokerEvent::Error(e) => {
                metrics::counter!(BROKER_ERRORS, "group" => self.config.group.clone()).increment(1);
                if is_all_brokers_down(&e) {
                    self.health.mark_disconnected();
                }
                warn!(error = %e, "Broker error");
                self.runner
                    .report_error(ConsumerError::Broker(e), None)
                    .await;
            }
            BrokerEvent::Other(description) => {
                debug!(event = %description, "Ignoring broker event");
            }
        }
    }

    async fn handle_record(&self, record: Arc<Record>) {
        metrics::counter!(RECORDS_RECEIVED, "group" => self.config.group.clone()).increment(1);
        self.offsets.on_pull(&record);

        let dispatched = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(DispatchError::Closed),
            result = self.dispatcher.on_message(record.clone()) => result,
        };

        if let Err(e) = dispatched {
            if self.shutdown.is_cancelled() {
                debug!(
                    topic = record.topic(),
                    partition = record.partition_number(),
                    offset = record.offset(),
                    "Dropping record pulled during shutdown"
                );
                return;
            }
            metrics::counter!(DISPATCH_ERRORS, "group" => self.config.group.clone()).increment(1);
            error!(
                topic = record.topic(),
                partition = record.partition_number(),
                offset = record.offset(),
                error = %e,
                "Failed to dispatch record"
            );
            self.runner
                .report_error(ConsumerError::Dispatch(e), Some(record))
                .await;
        }
    }

    async fn handle_assigned(&self, partitions: Vec<Partition>) {
        metrics::counter!(REBALANCE_EVENTS, "group" => self.config.group.clone(), "event_type" => "assign")
            .increment(1);
        let description = describe(&partitions);
        info!(partitions = %description, "Partitions assigned");

        self.pauses.clear();
        if let Err(e) = self.broker.assign(&partitions) {
            error!(error = %e, "Failed to take ownership of assigned partitions");
            self.runner
                .report_error(ConsumerError::Broker(e), None)
                .await;
        }
        self.health.mark_connected();
        self.assignment().extend(partitions.iter().cloned());

        self.offsets.on_assign(&partitions);
        self.dispatcher.on_assign(&partitions).await;
        self.runner
            .notify(&format!("partitions assigned: {description}"));
    }

    async fn handle_revoked(&self, partitions: Vec<Partition>) {
        metrics::counter!(REBALANCE_EVENTS, "group" => self.config.group.clone(), "event_type" => "revoke")
            .increment(1);
        let description = describe(&partitions);
        info!(partitions = %description, "Partitions revoked");

        self.pauses.clear();
        if let Err(e) = self.broker.unassign(&partitions) {
            error!(error = %e, "Failed to drop ownership of revoked partitions");
            self.runner
                .report_error(ConsumerError::Broker(e), None)
                .await;
        }
        {
            let mut assignment = self.assignment();
            for partition in &partitions {
                assignment.remove(partition);
            }
        }

        // in-flight completions still commit before progress is dropped
        self.dispatcher.on_revoke(&partitions).await;
        self.offsets.on_revoke(&partitions);
        self.runner
            .notify(&format!("partitions revoked: {description}"));
    }
}

fn describe(partitions: &[Partition]) -> String {
    partitions
        .iter()
        .map(Partition::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
