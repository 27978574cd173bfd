//! Shared helpers for the subscriber integration tests.
//!
//! Every test drives a [`Subscriber`] through a scripted [`MockBroker`], so no
//! Kafka cluster is needed.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kafka_consumer::broker::BrokerEvent;
use kafka_consumer::test_utils::{test_record, MockBroker};
use kafka_consumer::{Partition, Subscriber, SubscriberConfig, SubscriberError};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const TOPIC: &str = "events";

/// Route tracing output through the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Config with test-friendly timings: no retry delay, short polls.
pub fn test_config() -> SubscriberConfig {
    SubscriberConfig::new(["localhost:9092"], "test-group", [TOPIC])
        .with_retry_delay(Duration::ZERO)
        .with_handler_timeout(Duration::from_secs(5))
        .with_error_handler_timeout(Duration::from_secs(5))
        .with_poll_timeout(Duration::from_millis(5))
        .with_empty_queue_wait(Duration::from_millis(5))
}

pub fn partition(number: i32) -> Partition {
    Partition::new(TOPIC, number)
}

pub fn assign(broker: &MockBroker, partitions: &[i32]) {
    broker.push_event(BrokerEvent::Assigned(
        partitions.iter().map(|p| partition(*p)).collect(),
    ));
}

pub fn revoke(broker: &MockBroker, partitions: &[i32]) {
    broker.push_event(BrokerEvent::Revoked(
        partitions.iter().map(|p| partition(*p)).collect(),
    ));
}

pub fn push_records(broker: &MockBroker, partition: i32, offsets: impl IntoIterator<Item = i64>) {
    for offset in offsets {
        broker.push_record(test_record(TOPIC, partition, offset));
    }
}

pub fn spawn_subscriber(subscriber: &Subscriber) -> JoinHandle<Result<(), SubscriberError>> {
    let subscriber = subscriber.clone();
    tokio::spawn(async move { subscriber.start().await })
}

pub fn subscriber_with(config: SubscriberConfig) -> (Arc<MockBroker>, Subscriber) {
    init_tracing();
    let broker = Arc::new(MockBroker::new());
    let subscriber = Subscriber::with_broker(config, broker.clone()).unwrap();
    (broker, subscriber)
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
