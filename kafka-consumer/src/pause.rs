//! Pause/resume registry
//!
//! Keeps the set of paused partitions in step with the broker client. Every
//! public operation takes the registry mutex and makes at most one broker call
//! while holding it, so the map and the broker never disagree about a partition.
//!
//! In unordered mode pausing a partition only stops further fetching; records of
//! that partition already sitting in the shared queue still run on the pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rdkafka::error::KafkaResult;
use tracing::{debug, info};

use crate::broker::BrokerClient;
use crate::metrics_consts::PAUSE_RESUME_CALLS;
use crate::types::{Partition, PartitionOffset};

pub struct PauseRegistry {
    broker: Arc<dyn BrokerClient>,
    group: String,
    // partition -> offset to resume from
    paused: Mutex<HashMap<Partition, i64>>,
}

impl PauseRegistry {
    pub fn new(broker: Arc<dyn BrokerClient>, group: String) -> Self {
        Self {
            broker,
            group,
            paused: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Partition, i64>> {
        self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pause one partition. No-op when it is already paused.
    pub fn pause(&self, partition: Partition, offset: i64) -> KafkaResult<()> {
        let mut paused = self.lock();
        if paused.contains_key(&partition) {
            debug!(%partition, "Partition already paused");
            return Ok(());
        }

        self.broker
            .pause(&[PartitionOffset::new(partition.clone(), offset)])?;
        metrics::counter!(PAUSE_RESUME_CALLS, "group" => self.group.clone(), "action" => "pause")
            .increment(1);
        info!(%partition, offset = offset, "Paused partition");
        paused.insert(partition, offset);
        Ok(())
    }

    /// Resume one partition. No-op when it is not paused.
    pub fn resume(&self, partition: Partition, offset: i64) -> KafkaResult<()> {
        let mut paused = self.lock();
        if !paused.contains_key(&partition) {
            debug!(%partition, "Partition not paused");
            return Ok(());
        }

        self.broker
            .resume(&[PartitionOffset::new(partition.clone(), offset)])?;
        metrics::counter!(PAUSE_RESUME_CALLS, "group" => self.group.clone(), "action" => "resume")
            .increment(1);
        info!(%partition, offset = offset, "Resumed partition");
        paused.remove(&partition);
        Ok(())
    }

    /// Pause every assigned partition that is not paused yet, in one broker call.
    pub fn pause_all(&self) -> KafkaResult<()> {
        let mut paused = self.lock();
        let assignment = self.broker.assignment()?;
        let to_pause: Vec<PartitionOffset> = assignment
            .into_iter()
            .filter(|p| !paused.contains_key(p))
            .map(|p| PartitionOffset::new(p, -1))
            .collect();
        if to_pause.is_empty() {
            return Ok(());
        }

        self.broker.pause(&to_pause)?;
        metrics::counter!(PAUSE_RESUME_CALLS, "group" => self.group.clone(), "action" => "pause_all")
            .increment(1);
        info!("Paused {} partitions", to_pause.len());
        for entry in to_pause {
            paused.insert(entry.partition().clone(), entry.offset());
        }
        Ok(())
    }

    /// Resume every paused partition and forget them.
    pub fn resume_all(&self) -> KafkaResult<()> {
        let mut paused = self.lock();
        if paused.is_empty() {
            return Ok(());
        }

        let to_resume: Vec<PartitionOffset> = paused
            .iter()
            .map(|(p, offset)| PartitionOffset::new(p.clone(), *offset))
            .collect();
        self.broker.resume(&to_resume)?;
        metrics::counter!(PAUSE_RESUME_CALLS, "group" => self.group.clone(), "action" => "resume_all")
            .increment(1);
        info!("Resumed {} partitions", to_resume.len());
        paused.clear();
        Ok(())
    }

    /// Forget all pauses. The broker drops them on every rebalance; callers re-issue.
    pub fn clear(&self) {
        let mut paused = self.lock();
        if !paused.is_empty() {
            debug!("Clearing {} paused partitions", paused.len());
        }
        paused.clear();
    }

    pub fn is_paused(&self, partition: &Partition) -> bool {
        self.lock().contains_key(partition)
    }

    pub fn paused(&self) -> HashMap<Partition, i64> {
        self.lock().clone()
    }
}

/// Pause/resume capability handed to a [`crate::handler::PausableRecordHandler`].
#[derive(Clone)]
pub struct PartitionController {
    registry: Arc<PauseRegistry>,
}

impl PartitionController {
    pub fn new(registry: Arc<PauseRegistry>) -> Self {
        Self { registry }
    }

    pub fn pause(&self, topic: &str, partition: i32, offset: i64) -> KafkaResult<()> {
        self.registry.pause(Partition::new(topic, partition), offset)
    }

    pub fn resume(&self, topic: &str, partition: i32, offset: i64) -> KafkaResult<()> {
        self.registry.resume(Partition::new(topic, partition), offset)
    }

    pub fn pause_all(&self) -> KafkaResult<()> {
        self.registry.pause_all()
    }

    pub fn resume_all(&self) -> KafkaResult<()> {
        self.registry.resume_all()
    }

    pub fn is_paused(&self, topic: &str, partition: i32) -> bool {
        self.registry.is_paused(&Partition::new(topic, partition))
    }
}
