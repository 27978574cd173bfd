use std::sync::Arc;

use tokio::sync::{AcquireError, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{info, Instrument};

use crate::runner::HandlerRunner;
use crate::types::Record;

/// Fixed-size pool of handler runs, shared by every queue generation of a subscriber.
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        info!("Creating worker pool with {} workers", size);
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
        }
    }

    /// Run `record` on a free worker, waiting for one if all are busy.
    /// Fails once the pool is closed.
    pub async fn submit(
        &self,
        runner: Arc<HandlerRunner>,
        record: Arc<Record>,
    ) -> Result<(), AcquireError> {
        let permit = self.permits.clone().acquire_owned().await?;
        self.tracker.spawn(
            async move {
                runner.run(record).await;
                drop(permit);
            }
            .in_current_span(),
        );
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn in_flight(&self) -> usize {
        self.size - self.permits.available_permits().min(self.size)
    }

    /// Refuse new submissions. Runs already started keep going.
    pub fn close(&self) {
        self.permits.close();
        self.tracker.close();
    }

    /// [`Self::close`] and wait for every started run to finish.
    pub async fn drain(&self) {
        self.close();
        self.tracker.wait().await;
    }
}
