//! Kafka consumer-group runtime.
//!
//! A [`Subscriber`] joins a consumer group, polls on one dedicated thread and hands
//! every record to an application [`RecordHandler`] with a per-record timeout,
//! bounded retries and panic isolation. Records are dispatched either per
//! partition in order ([`ConsumerMode::Ordered`]) or through a shared worker pool
//! ([`ConsumerMode::Unordered`]); offsets are committed on pull or, gap-aware, on
//! completion ([`CommitMode`]).
//!
//! ## Error logging (anyhow)
//!
//! Handler errors are `anyhow::Error`. Log them with `{e:#}` or `error = ?e` so the
//! whole cause chain shows up, and build them with `.context()` rather than
//! formatting the source into a new message.

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod health;
pub mod metrics_consts;
pub mod offsets;
pub mod pause;
pub mod runner;
pub mod subscriber;
pub mod test_utils;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{CommitMode, Config, ConsumerMode, InitialOffset, SubscriberConfig};
pub use error::{ConfigError, ConsumerError, DispatchError, SubscriberError};
pub use handler::{
    ErrorContext, ErrorHandler, NotificationHandler, PausableRecordHandler, RecordHandler,
};
pub use health::HealthSnapshot;
pub use pause::PartitionController;
pub use subscriber::Subscriber;
pub use types::{Partition, PartitionOffset, Record};
