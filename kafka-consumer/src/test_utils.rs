use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use tokio::sync::Semaphore;

use crate::broker::{BrokerClient, BrokerEvent};
use crate::error::ConsumerError;
use crate::handler::{
    ErrorContext, ErrorHandler, NotificationHandler, PausableRecordHandler, RecordHandler,
};
use crate::pause::PartitionController;
use crate::types::{Partition, PartitionOffset, Record};

/// Test utilities for unit tests and the tests/ directory
pub fn test_record(topic: &str, partition: i32, offset: i64) -> Arc<Record> {
    Arc::new(Record::new(
        Partition::new(topic, partition),
        offset,
        format!("key-{offset}").into_bytes(),
        format!("payload-{offset}").into_bytes(),
        HashMap::new(),
    ))
}

// In-memory broker client with scripted poll events and recorded calls
#[derive(Default)]
pub struct MockBroker {
    events: Mutex<VecDeque<BrokerEvent>>,
    assignment: Mutex<Vec<Partition>>,
    paused: Mutex<HashSet<Partition>>,
    pause_calls: Mutex<Vec<Vec<PartitionOffset>>>,
    resume_calls: Mutex<Vec<Vec<PartitionOffset>>>,
    stored: Mutex<Vec<(Partition, i64)>>,
    subscribed: Mutex<Vec<String>>,
    poll_timeouts: Mutex<Vec<Duration>>,
    commit_count: AtomicUsize,
    closed: AtomicBool,
    fail_store: AtomicBool,
    fail_pause_resume: AtomicBool,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&self, event: BrokerEvent) {
        self.events.lock().unwrap().push_back(event);
    }

    pub fn push_record(&self, record: Arc<Record>) {
        self.push_event(BrokerEvent::Record(record));
    }

    pub fn pending_events(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn set_assignment(&self, partitions: Vec<Partition>) {
        *self.assignment.lock().unwrap() = partitions;
    }

    pub fn fail_store(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pause_resume(&self, fail: bool) {
        self.fail_pause_resume.store(fail, Ordering::SeqCst);
    }

    pub fn stored_offsets(&self) -> Vec<(Partition, i64)> {
        self.stored.lock().unwrap().clone()
    }

    pub fn stored_offsets_for(&self, partition: &Partition) -> Vec<i64> {
        self.stored
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == partition)
            .map(|(_, o)| *o)
            .collect()
    }

    pub fn pause_calls(&self) -> Vec<Vec<PartitionOffset>> {
        self.pause_calls.lock().unwrap().clone()
    }

    pub fn resume_calls(&self) -> Vec<Vec<PartitionOffset>> {
        self.resume_calls.lock().unwrap().clone()
    }

    pub fn is_paused(&self, partition: &Partition) -> bool {
        self.paused.lock().unwrap().contains(partition)
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn poll_timeouts(&self) -> Vec<Duration> {
        self.poll_timeouts.lock().unwrap().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.commit_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl BrokerClient for MockBroker {
    fn subscribe(&self, topics: &[String]) -> KafkaResult<()> {
        *self.subscribed.lock().unwrap() = topics.to_vec();
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Option<BrokerEvent> {
        self.poll_timeouts.lock().unwrap().push(timeout);
        let event = self.events.lock().unwrap().pop_front();
        if event.is_none() {
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
        }
        event
    }

    fn assign(&self, partitions: &[Partition]) -> KafkaResult<()> {
        let mut assignment = self.assignment.lock().unwrap();
        for partition in partitions {
            if !assignment.contains(partition) {
                assignment.push(partition.clone());
            }
        }
        Ok(())
    }

    fn unassign(&self, partitions: &[Partition]) -> KafkaResult<()> {
        self.assignment
            .lock()
            .unwrap()
            .retain(|p| !partitions.contains(p));
        let mut paused = self.paused.lock().unwrap();
        for partition in partitions {
            paused.remove(partition);
        }
        Ok(())
    }

    fn assignment(&self) -> KafkaResult<Vec<Partition>> {
        Ok(self.assignment.lock().unwrap().clone())
    }

    fn pause(&self, partitions: &[PartitionOffset]) -> KafkaResult<()> {
        if self.fail_pause_resume.load(Ordering::SeqCst) {
            return Err(KafkaError::PauseResume("mock pause failure".to_string()));
        }
        self.pause_calls.lock().unwrap().push(partitions.to_vec());
        let mut paused = self.paused.lock().unwrap();
        for entry in partitions {
            paused.insert(entry.partition().clone());
        }
        Ok(())
    }

    fn resume(&self, partitions: &[PartitionOffset]) -> KafkaResult<()> {
        if self.fail_pause_resume.load(Ordering::SeqCst) {
            return Err(KafkaError::PauseResume("mock resume failure".to_string()));
        }
        self.resume_calls.lock().unwrap().push(partitions.to_vec());
        let mut paused = self.paused.lock().unwrap();
        for entry in partitions {
            paused.remove(entry.partition());
        }
        Ok(())
    }

    fn store_offsets(&self, offsets: &[PartitionOffset]) -> KafkaResult<()> {
        if self.fail_store.load(Ordering::SeqCst) {
            return Err(KafkaError::StoreOffset(RDKafkaErrorCode::UnknownPartition));
        }
        let mut stored = self.stored.lock().unwrap();
        for entry in offsets {
            stored.push((entry.partition().clone(), entry.offset()));
        }
        Ok(())
    }

    fn commit_offsets(&self) -> KafkaResult<()> {
        self.commit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Record handler that records what it saw and can be told to fail, panic or dawdle.
#[derive(Default)]
pub struct RecordingHandler {
    delay: Duration,
    // offset -> remaining failures
    failures: Mutex<HashMap<i64, u32>>,
    panic_offsets: HashSet<i64>,
    attempts: AtomicUsize,
    started: Mutex<Vec<(Partition, i64)>>,
    handled: Mutex<Vec<(Partition, i64)>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail `times` attempts for `offset`; `u32::MAX` fails forever.
    pub fn fail_on(self, offset: i64, times: u32) -> Self {
        self.failures.lock().unwrap().insert(offset, times);
        self
    }

    pub fn panic_on(mut self, offset: i64) -> Self {
        self.panic_offsets.insert(offset);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn started_offsets(&self) -> Vec<(Partition, i64)> {
        self.started.lock().unwrap().clone()
    }

    pub fn handled_offsets(&self) -> Vec<(Partition, i64)> {
        self.handled.lock().unwrap().clone()
    }

    pub fn handled_for(&self, partition: &Partition) -> Vec<i64> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == partition)
            .map(|(_, o)| *o)
            .collect()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(&self, record: Arc<Record>) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.started
            .lock()
            .unwrap()
            .push((record.partition().clone(), record.offset()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panic_offsets.contains(&record.offset()) {
            panic!("handler exploded on offset {}", record.offset());
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&record.offset()) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    bail!("failed to process offset {}", record.offset());
                }
            }
        }

        self.handled
            .lock()
            .unwrap()
            .push((record.partition().clone(), record.offset()));
        Ok(())
    }
}

/// Handler that blocks every attempt until the test hands out permits.
pub struct GatedHandler {
    gate: Semaphore,
    started: AtomicUsize,
    finished: Mutex<Vec<(Partition, i64)>>,
}

impl Default for GatedHandler {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            finished: Mutex::new(Vec::new()),
        }
    }
}

impl GatedHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `n` more attempts finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished_offsets(&self) -> Vec<(Partition, i64)> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordHandler for GatedHandler {
    async fn handle(&self, record: Arc<Record>) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await?.forget();
        self.finished
            .lock()
            .unwrap()
            .push((record.partition().clone(), record.offset()));
        Ok(())
    }
}

/// Handler that records the name of the tracing span each attempt runs in.
#[derive(Default)]
pub struct SpanRecordingHandler {
    spans: Mutex<Vec<Option<String>>>,
}

impl SpanRecordingHandler {
    pub fn span_names(&self) -> Vec<Option<String>> {
        self.spans.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordHandler for SpanRecordingHandler {
    async fn handle(&self, _record: Arc<Record>) -> Result<()> {
        let name = tracing::Span::current()
            .metadata()
            .map(|metadata| metadata.name().to_string());
        self.spans.lock().unwrap().push(name);
        Ok(())
    }
}

/// Pausable handler that pauses the record's partition when it sees `pause_at`.
#[derive(Default)]
pub struct RecordingPausableHandler {
    pause_at: Option<i64>,
    handled: Mutex<Vec<(Partition, i64)>>,
}

impl RecordingPausableHandler {
    pub fn pausing_at(offset: i64) -> Self {
        Self {
            pause_at: Some(offset),
            handled: Mutex::new(Vec::new()),
        }
    }

    pub fn handled_offsets(&self) -> Vec<(Partition, i64)> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl PausableRecordHandler for RecordingPausableHandler {
    async fn handle(&self, record: Arc<Record>, controller: PartitionController) -> Result<()> {
        if self.pause_at == Some(record.offset()) {
            controller.pause(record.topic(), record.partition_number(), record.offset() + 1)?;
        }
        self.handled
            .lock()
            .unwrap()
            .push((record.partition().clone(), record.offset()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ReportedError {
    pub context: ErrorContext,
    pub message: String,
    pub is_panic: bool,
    pub is_dispatch: bool,
    pub is_broker: bool,
    pub record: Option<(Partition, i64)>,
    pub backtrace: Option<String>,
}

/// Error handler that keeps every report; optionally sleeps or panics first.
#[derive(Default)]
pub struct RecordingErrorHandler {
    delay: Duration,
    panics: bool,
    reports: Mutex<Vec<ReportedError>>,
}

impl RecordingErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::default()
        }
    }

    pub fn reports(&self) -> Vec<ReportedError> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ErrorHandler for RecordingErrorHandler {
    async fn on_error(
        &self,
        context: ErrorContext,
        error: ConsumerError,
        record: Option<Arc<Record>>,
    ) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics {
            panic!("error handler exploded");
        }
        self.reports.lock().unwrap().push(ReportedError {
            context,
            message: error.to_string(),
            is_panic: matches!(error, ConsumerError::HandlerPanic { .. }),
            is_dispatch: matches!(error, ConsumerError::Dispatch(_)),
            is_broker: matches!(error, ConsumerError::Broker(_)),
            record: record.map(|r| (r.partition().clone(), r.offset())),
            backtrace: match &error {
                ConsumerError::HandlerPanic { backtrace, .. } => Some(backtrace.clone()),
                _ => None,
            },
        });
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notifications: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }
}

impl NotificationHandler for RecordingNotifier {
    fn notify(&self, notification: &str) {
        self.notifications
            .lock()
            .unwrap()
            .push(notification.to_string());
    }
}
