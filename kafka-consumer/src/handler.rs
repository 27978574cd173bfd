use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::ConsumerError;
use crate::pause::PartitionController;
use crate::types::Record;

/// Processes one record. Returning an error triggers a retry until the retry budget is spent.
///
/// Attempts are raced against the per-record timeout but never cancelled: an attempt
/// that outlives its timeout keeps running in the background while the runtime moves on.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: Arc<Record>) -> Result<()>;
}

/// Same as [`RecordHandler`], but also receives a [`PartitionController`] so the
/// handler can pause or resume fetching while it works.
#[async_trait]
pub trait PausableRecordHandler: Send + Sync {
    async fn handle(&self, record: Arc<Record>, controller: PartitionController) -> Result<()>;
}

/// Where the reported error came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub group: String,
    pub transaction_id: Option<String>,
}

/// Receives every error the runtime cannot handle itself.
///
/// Runs under its own timeout; panics are trapped and logged.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn on_error(&self, context: ErrorContext, error: ConsumerError, record: Option<Arc<Record>>);
}

/// Receives human readable notices about assignments, revocations and shutdown.
pub trait NotificationHandler: Send + Sync {
    fn notify(&self, notification: &str);
}

/// The record handler variant supplied at construction.
#[derive(Clone)]
pub(crate) enum Handler {
    Plain(Arc<dyn RecordHandler>),
    Pausable(Arc<dyn PausableRecordHandler>),
}

impl Handler {
    pub(crate) async fn invoke(
        &self,
        record: Arc<Record>,
        controller: &PartitionController,
    ) -> Result<()> {
        match self {
            Handler::Plain(handler) => handler.handle(record).await,
            Handler::Pausable(handler) => handler.handle(record, controller.clone()).await,
        }
    }
}
