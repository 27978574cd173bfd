use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::ConfigError;
use crate::handler::{
    ErrorHandler, Handler, NotificationHandler, PausableRecordHandler, RecordHandler,
};

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ERROR_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_COUNT: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_millis(5000);
pub const DEFAULT_EMPTY_QUEUE_WAIT: Duration = Duration::from_millis(500);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(150);
pub const DEFAULT_WORKERS_PER_CORE: usize = 2;

/// When offsets are marked for commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Mark as soon as the record is pulled: at-most-once.
    OnPull,
    /// Mark once every earlier offset of the partition finished: at-least-once.
    OnCompletion,
}

/// How records are dispatched to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMode {
    /// One worker per partition, strict offset order within a partition.
    Ordered,
    /// One shared queue feeding a worker pool, no ordering at all.
    Unordered,
}

/// Where to start when the group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialOffset {
    Newest,
    Oldest,
}

impl InitialOffset {
    /// Value for librdkafka's `auto.offset.reset`.
    pub fn as_offset_reset(&self) -> &'static str {
        match self {
            InitialOffset::Newest => "latest",
            InitialOffset::Oldest => "earliest",
        }
    }
}

impl FromStr for CommitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_ref() {
            "on_pull" => Ok(CommitMode::OnPull),
            "on_completion" => Ok(CommitMode::OnCompletion),
            _ => Err(format!(
                "Unknown commit mode: {s}, must be on_pull or on_completion"
            )),
        }
    }
}

impl FromStr for ConsumerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "ordered" => Ok(ConsumerMode::Ordered),
            "unordered" => Ok(ConsumerMode::Unordered),
            _ => Err(format!(
                "Unknown consumer mode: {s}, must be ordered or unordered"
            )),
        }
    }
}

impl FromStr for InitialOffset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "newest" | "latest" => Ok(InitialOffset::Newest),
            "oldest" | "earliest" => Ok(InitialOffset::Oldest),
            _ => Err(format!(
                "Unknown initial offset: {s}, must be newest or oldest"
            )),
        }
    }
}

impl fmt::Display for CommitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitMode::OnPull => write!(f, "on_pull"),
            CommitMode::OnCompletion => write!(f, "on_completion"),
        }
    }
}

impl fmt::Display for ConsumerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerMode::Ordered => write!(f, "ordered"),
            ConsumerMode::Unordered => write!(f, "unordered"),
        }
    }
}

/// Construction-time options of a [`crate::Subscriber`].
#[derive(Clone)]
pub struct SubscriberConfig {
    pub brokers: Vec<String>,
    pub group: String,
    pub topics: Vec<String>,
    pub workers_per_core: usize,
    pub commit_mode: CommitMode,
    pub consumer_mode: ConsumerMode,
    pub handler_timeout: Duration,
    pub error_handler_timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub initial_offset: InitialOffset,
    pub max_queue_size: usize,
    pub commit_interval: Duration,
    pub empty_queue_wait: Duration,
    pub poll_timeout: Duration,
    pub tls: bool,
    pub kafka_config: Vec<(String, String)>,

    handler: Option<Arc<dyn RecordHandler>>,
    pausable_handler: Option<Arc<dyn PausableRecordHandler>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    notification_handler: Option<Arc<dyn NotificationHandler>>,
}

impl fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("brokers", &self.brokers)
            .field("group", &self.group)
            .field("topics", &self.topics)
            .field("workers_per_core", &self.workers_per_core)
            .field("commit_mode", &self.commit_mode)
            .field("consumer_mode", &self.consumer_mode)
            .field("handler_timeout", &self.handler_timeout)
            .field("error_handler_timeout", &self.error_handler_timeout)
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("initial_offset", &self.initial_offset)
            .field("max_queue_size", &self.max_queue_size)
            .field("commit_interval", &self.commit_interval)
            .field("empty_queue_wait", &self.empty_queue_wait)
            .field("poll_timeout", &self.poll_timeout)
            .field("tls", &self.tls)
            .field("has_handler", &self.handler.is_some())
            .field("has_pausable_handler", &self.pausable_handler.is_some())
            .field("has_error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl SubscriberConfig {
    pub fn new<B, T>(brokers: B, group: impl Into<String>, topics: T) -> Self
    where
        B: IntoIterator,
        B::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            group: group.into(),
            topics: topics.into_iter().map(Into::into).collect(),
            workers_per_core: DEFAULT_WORKERS_PER_CORE,
            commit_mode: CommitMode::OnCompletion,
            consumer_mode: ConsumerMode::Ordered,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            error_handler_timeout: DEFAULT_ERROR_HANDLER_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            initial_offset: InitialOffset::Newest,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            empty_queue_wait: DEFAULT_EMPTY_QUEUE_WAIT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            tls: false,
            kafka_config: Vec::new(),
            handler: None,
            pausable_handler: None,
            error_handler: None,
            notification_handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn RecordHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_pausable_handler(mut self, handler: Arc<dyn PausableRecordHandler>) -> Self {
        self.pausable_handler = Some(handler);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_notification_handler(mut self, handler: Arc<dyn NotificationHandler>) -> Self {
        self.notification_handler = Some(handler);
        self
    }

    pub fn with_workers_per_core(mut self, workers_per_core: usize) -> Self {
        self.workers_per_core = workers_per_core;
        self
    }

    pub fn with_commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = mode;
        self
    }

    pub fn with_consumer_mode(mut self, mode: ConsumerMode) -> Self {
        self.consumer_mode = mode;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_error_handler_timeout(mut self, timeout: Duration) -> Self {
        self.error_handler_timeout = timeout;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_initial_offset(mut self, initial_offset: InitialOffset) -> Self {
        self.initial_offset = initial_offset;
        self
    }

    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn with_empty_queue_wait(mut self, wait: Duration) -> Self {
        self.empty_queue_wait = wait;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Pass an extra librdkafka property through to the client.
    pub fn with_kafka_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kafka_config.push((key.into(), value.into()));
        self
    }

    /// Reject configurations the runtime cannot honour. Nothing is started before this passes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(ConfigError::NoBrokers);
        }
        if self.group.trim().is_empty() {
            return Err(ConfigError::EmptyGroup);
        }
        if self.topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        if self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::EmptyTopic);
        }
        match (&self.handler, &self.pausable_handler) {
            (None, None) => return Err(ConfigError::MissingHandler),
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingHandlers),
            _ => {}
        }
        if self.consumer_mode == ConsumerMode::Unordered
            && self.commit_mode == CommitMode::OnCompletion
        {
            return Err(ConfigError::UnorderedWithOnCompletion);
        }
        if self.handler_timeout.is_zero() {
            return Err(ConfigError::InvalidSetting {
                name: "handler_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_queue_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.workers_per_core == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "workers_per_core",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Size of the unordered worker pool: `workers_per_core * available cores`.
    pub fn worker_pool_size(&self) -> usize {
        self.workers_per_core.max(1) * num_cpus::get().max(1)
    }

    pub fn bootstrap_servers(&self) -> String {
        self.brokers
            .iter()
            .map(|b| b.trim())
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub(crate) fn record_handler(&self) -> Option<Handler> {
        match (&self.handler, &self.pausable_handler) {
            (Some(handler), None) => Some(Handler::Plain(handler.clone())),
            (None, Some(handler)) => Some(Handler::Pausable(handler.clone())),
            _ => None,
        }
    }

    pub(crate) fn error_handler(&self) -> Option<Arc<dyn ErrorHandler>> {
        self.error_handler.clone()
    }

    pub(crate) fn notification_handler(&self) -> Option<Arc<dyn NotificationHandler>> {
        self.notification_handler.clone()
    }

    /// Build the librdkafka client configuration for these options.
    pub fn to_client_config(&self) -> ClientConfig {
        let mut builder =
            ConsumerConfigBuilder::new(&self.bootstrap_servers(), &self.group)
                .with_offset_reset(self.initial_offset.as_offset_reset())
                .with_auto_commit_interval(self.commit_interval)
                .with_tls(self.tls);

        for (key, value) in &self.kafka_config {
            builder = builder.set(key, value);
        }

        builder.build()
    }
}

/// Environment-driven settings. Handlers cannot come from the environment, so this
/// converts into a [`SubscriberConfig`] that the caller completes.
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    pub kafka_consumer_group: String,

    // comma separated
    pub kafka_consumer_topics: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "2")]
    pub workers_per_core: usize,

    #[envconfig(default = "on_completion")]
    pub commit_mode: CommitMode,

    #[envconfig(default = "ordered")]
    pub consumer_mode: ConsumerMode,

    #[envconfig(default = "60000")]
    pub handler_timeout_ms: u64,

    #[envconfig(default = "60000")]
    pub error_handler_timeout_ms: u64,

    #[envconfig(default = "10")]
    pub retry_count: u32,

    #[envconfig(default = "30000")]
    pub retry_delay_ms: u64,

    #[envconfig(default = "newest")]
    pub initial_offset: InitialOffset,

    #[envconfig(default = "100")]
    pub max_queue_size: usize,

    #[envconfig(default = "5000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "500")]
    pub empty_queue_wait_ms: u64,

    #[envconfig(default = "150")]
    pub poll_timeout_ms: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn topics(&self) -> Vec<String> {
        split_list(&self.kafka_consumer_topics)
    }

    pub fn brokers(&self) -> Vec<String> {
        split_list(&self.kafka_hosts)
    }

    pub fn to_subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig::new(
            self.brokers(),
            self.kafka_consumer_group.clone(),
            self.topics(),
        )
        .with_tls(self.kafka_tls)
        .with_workers_per_core(self.workers_per_core)
        .with_commit_mode(self.commit_mode)
        .with_consumer_mode(self.consumer_mode)
        .with_handler_timeout(Duration::from_millis(self.handler_timeout_ms))
        .with_error_handler_timeout(Duration::from_millis(self.error_handler_timeout_ms))
        .with_retry_count(self.retry_count)
        .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
        .with_initial_offset(self.initial_offset)
        .with_max_queue_size(self.max_queue_size)
        .with_commit_interval(Duration::from_millis(self.commit_interval_ms))
        .with_empty_queue_wait(Duration::from_millis(self.empty_queue_wait_ms))
        .with_poll_timeout(Duration::from_millis(self.poll_timeout_ms))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// librdkafka configuration for the subscriber's group consumer.
///
/// Offsets are stored explicitly by the runtime (`enable.auto.offset.store=false`)
/// and flushed by librdkafka on the auto-commit interval.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// How often librdkafka flushes stored offsets to the group coordinator.
    pub fn with_auto_commit_interval(mut self, interval: Duration) -> Self {
        self.config
            .set("auto.commit.interval.ms", interval.as_millis().to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
