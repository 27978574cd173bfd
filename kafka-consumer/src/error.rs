use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::types::Partition;

/// Rejected construction-time configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one broker address is required")]
    NoBrokers,
    #[error("consumer group name must not be empty")]
    EmptyGroup,
    #[error("at least one topic is required")]
    NoTopics,
    #[error("topic names must not be empty")]
    EmptyTopic,
    #[error("a record handler is required")]
    MissingHandler,
    #[error("only one record handler may be configured, got both the plain and the pausable variant")]
    ConflictingHandlers,
    #[error("unordered consumer mode cannot be combined with on-completion offset commits")]
    UnorderedWithOnCompletion,
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

/// Failure handing a record to the dispatch strategy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no worker for partition {0} - was it revoked?")]
    NoPartitionWorker(Partition),
    #[error("no queue accepting records - partitions not assigned or revoked")]
    NoQueue,
    #[error("worker for partition {0} stopped before accepting the record")]
    WorkerStopped(Partition),
    #[error("dispatcher is closed")]
    Closed,
}

/// Errors handed to the user-supplied error handler.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("handler failed after {attempts} attempt(s): {source:#}")]
    Handler {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("handler panicked: {message}\n{backtrace}")]
    HandlerPanic { message: String, backtrace: String },
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("broker error: {0}")]
    Broker(#[from] KafkaError),
}

impl ConsumerError {
    pub fn is_all_brokers_down(&self) -> bool {
        matches!(self, ConsumerError::Broker(e) if is_all_brokers_down(e))
    }
}

/// Errors returned from the subscriber lifecycle calls.
#[derive(Error, Debug)]
pub enum SubscriberError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("broker error: {0}")]
    Broker(#[from] KafkaError),
    #[error("subscriber already started")]
    AlreadyStarted,
    #[error("subscriber is closed")]
    Closed,
    #[error("poll loop terminated abnormally: {0}")]
    PollLoop(String),
}

pub fn is_all_brokers_down(error: &KafkaError) -> bool {
    error.rdkafka_error_code() == Some(RDKafkaErrorCode::AllBrokersDown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_brokers_down_detection() {
        let down = KafkaError::Global(RDKafkaErrorCode::AllBrokersDown);
        let other = KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure);

        assert!(is_all_brokers_down(&down));
        assert!(!is_all_brokers_down(&other));
        assert!(ConsumerError::Broker(down).is_all_brokers_down());
        assert!(!ConsumerError::Broker(other).is_all_brokers_down());
    }

    #[test]
    fn test_handler_error_keeps_chain() {
        let source = anyhow::anyhow!("db unavailable").context("writing event");
        let err = ConsumerError::Handler {
            attempts: 3,
            source,
        };
        let text = err.to_string();
        assert!(text.contains("3 attempt(s)"));
        assert!(text.contains("writing event"));
        assert!(text.contains("db unavailable"));
    }
}
