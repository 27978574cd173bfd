use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use uuid::Uuid;

/// Header carrying an upstream transaction identifier. When absent a fresh one is generated.
pub const TRANSACTION_ID_HEADER: &str = "transaction_id";

/// A `(topic, partition)` pair, compared and hashed by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// An immutable record pulled from the broker.
///
/// Records are shared as `Arc<Record>` between the poll loop, the dispatch
/// queues and handler attempts; nothing mutates them after construction.
#[derive(Debug, Clone)]
pub struct Record {
    partition: Partition,
    offset: i64,
    key: Vec<u8>,
    payload: Vec<u8>,
    headers: HashMap<String, Vec<u8>>,
    pulled_at: DateTime<Utc>,
    transaction_id: String,
}

impl Record {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Vec<u8>,
        payload: Vec<u8>,
        headers: HashMap<String, Vec<u8>>,
    ) -> Self {
        let transaction_id = headers
            .get(TRANSACTION_ID_HEADER)
            .and_then(|value| std::str::from_utf8(value).ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        Self {
            partition,
            offset,
            key,
            payload,
            headers,
            pulled_at: Utc::now(),
            transaction_id,
        }
    }

    /// Build a record from a polled rdkafka message. Duplicate header names collapse, last one wins.
    pub fn from_message(message: &BorrowedMessage<'_>) -> Self {
        let mut headers = HashMap::new();
        if let Some(message_headers) = message.headers() {
            for header in message_headers.iter() {
                headers.insert(
                    header.key.to_string(),
                    header.value.map(<[u8]>::to_vec).unwrap_or_default(),
                );
            }
        }

        Self::new(
            Partition::new(message.topic(), message.partition()),
            message.offset(),
            message.key().map(<[u8]>::to_vec).unwrap_or_default(),
            message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
        )
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &HashMap<String, Vec<u8>> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }

    /// UTC time the record was taken off the broker.
    pub fn pulled_at(&self) -> DateTime<Utc> {
        self.pulled_at
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }
}
