use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerEvent;
use crate::metrics_consts::REBALANCE_EMPTY_SKIPPED;
use crate::types::Partition;

/// rdkafka context that turns rebalance and client error callbacks into [`BrokerEvent`]s.
///
/// librdkafka fires these callbacks from inside `poll`. They are queued here and
/// handed out by [`crate::broker::KafkaBrokerClient::poll`] ahead of any record
/// returned by the same poll, so the dispatch strategy always sees the new
/// assignment before records for it.
pub struct SubscriberContext {
    group: String,
    events: Mutex<VecDeque<BrokerEvent>>,
}

impl SubscriberContext {
    pub fn new(group: String) -> Self {
        Self {
            group,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push_event(&self, event: BrokerEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }

    pub(crate) fn pop_event(&self) -> Option<BrokerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub(crate) fn pending_events(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn partitions(tpl: &TopicPartitionList) -> Vec<Partition> {
        tpl.elements().into_iter().map(Partition::from).collect()
    }
}

impl ClientContext for SubscriberContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(error = %error, reason = reason, "librdkafka client error");
        self.push_event(BrokerEvent::Error(error));
    }
}

impl ConsumerContext for SubscriberContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative no-op rebalances arrive with an empty list
                if partitions.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "group" => self.group.clone(), "event_type" => "revoke")
                        .increment(1);
                    return;
                }
                info!("Revoking {} partitions", partitions.count());
                self.push_event(BrokerEvent::Revoked(Self::partitions(partitions)));
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
                self.push_event(BrokerEvent::Other(format!("rebalance error: {e}")));
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED, "group" => self.group.clone(), "event_type" => "assign")
                        .increment(1);
                    return;
                }
                info!("Assigned {} partitions", partitions.count());
                self.push_event(BrokerEvent::Assigned(Self::partitions(partitions)));
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!("Committed offsets for {} partitions", offsets.count());
            }
            // the next interval retries
            Err(e) => {
                debug!("Failed to commit offsets: {}", e);
            }
        }
    }
}
