use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::broker::{BrokerClient, BrokerEvent, SubscriberContext};
use crate::types::{Partition, PartitionOffset, Record};

/// [`BrokerClient`] backed by an rdkafka `BaseConsumer`.
///
/// librdkafka applies assignments inside its own rebalance callback, so `assign`
/// and `unassign` only reconcile whatever the callback did not already cover.
pub struct KafkaBrokerClient {
    consumer: BaseConsumer<SubscriberContext>,
}

impl KafkaBrokerClient {
    pub fn new(config: &ClientConfig) -> KafkaResult<Self> {
        let group = config.get("group.id").unwrap_or_default().to_string();
        let consumer: BaseConsumer<SubscriberContext> =
            config.create_with_context(SubscriberContext::new(group))?;
        Ok(Self { consumer })
    }

    fn partition_list(partitions: &[Partition]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::with_capacity(partitions.len());
        for partition in partitions {
            tpl.add_partition(partition.topic(), partition.partition_number());
        }
        tpl
    }

    fn offset_list(offsets: &[PartitionOffset]) -> KafkaResult<TopicPartitionList> {
        let mut tpl = TopicPartitionList::with_capacity(offsets.len());
        for offset in offsets {
            let position = match offset.offset() {
                n if n >= 0 => Offset::Offset(n),
                _ => Offset::Invalid,
            };
            tpl.add_partition_offset(offset.topic(), offset.partition_number(), position)?;
        }
        Ok(tpl)
    }
}

impl BrokerClient for KafkaBrokerClient {
    fn subscribe(&self, topics: &[String]) -> KafkaResult<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)
    }

    fn poll(&self, timeout: Duration) -> Option<BrokerEvent> {
        let context = self.consumer.context();
        if let Some(event) = context.pop_event() {
            return Some(event);
        }

        let polled = self.consumer.poll(timeout);

        // rebalance callbacks fired during this poll go out before the record
        let record = polled.map(|result| match result {
            Ok(message) => BrokerEvent::Record(Arc::new(Record::from_message(&message))),
            Err(e) => BrokerEvent::Error(e),
        });
        match record {
            Some(event) if context.pending_events() > 0 => {
                context.push_event(event);
                context.pop_event()
            }
            Some(event) => Some(event),
            None => context.pop_event(),
        }
    }

    fn assign(&self, partitions: &[Partition]) -> KafkaResult<()> {
        let current: HashSet<Partition> = self.assignment()?.into_iter().collect();
        if partitions.iter().all(|p| current.contains(p)) {
            return Ok(());
        }

        let mut merged: Vec<Partition> = current.into_iter().collect();
        merged.extend(partitions.iter().cloned());
        merged.sort();
        merged.dedup();
        info!("Assigning {} partitions", merged.len());
        self.consumer.assign(&Self::partition_list(&merged))
    }

    fn unassign(&self, partitions: &[Partition]) -> KafkaResult<()> {
        let current = self.assignment()?;
        let revoked: HashSet<&Partition> = partitions.iter().collect();
        if !current.iter().any(|p| revoked.contains(p)) {
            return Ok(());
        }

        let remaining: Vec<Partition> = current
            .into_iter()
            .filter(|p| !revoked.contains(p))
            .collect();
        if remaining.is_empty() {
            self.consumer.unassign()
        } else {
            self.consumer.assign(&Self::partition_list(&remaining))
        }
    }

    fn assignment(&self) -> KafkaResult<Vec<Partition>> {
        Ok(self
            .consumer
            .assignment()?
            .elements()
            .into_iter()
            .map(Partition::from)
            .collect())
    }

    fn pause(&self, partitions: &[PartitionOffset]) -> KafkaResult<()> {
        self.consumer.pause(&Self::offset_list(partitions)?)
    }

    fn resume(&self, partitions: &[PartitionOffset]) -> KafkaResult<()> {
        self.consumer.resume(&Self::offset_list(partitions)?)
    }

    fn store_offsets(&self, offsets: &[PartitionOffset]) -> KafkaResult<()> {
        self.consumer.store_offsets(&Self::offset_list(offsets)?)
    }

    fn commit_offsets(&self) -> KafkaResult<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            // nothing stored since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            other => other,
        }
    }

    fn close(&self) {
        debug!("Unsubscribing broker client");
        self.consumer.unsubscribe();
    }
}
