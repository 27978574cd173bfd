//! On-completion committer - gap-aware at-least-once offset commits
//!
//! Every offset handed to the handler is tracked as in progress until the runner
//! reports it done. The committable offset of a partition is the last entry of the
//! longest completed prefix of the sorted entry list, i.e. the highest completed
//! offset below the lowest offset still in progress. A completion that leaves a
//! gap behind it is held until the gap closes.
//!
//! Working out and storing the next commit is serialised per partition by a
//! single-permit semaphore. A completion that finds the permit taken only flags
//! its entry; the permit holder re-walks before giving the permit back and the
//! completing side re-checks after the holder releases, so no completion is left
//! uncommitted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::metrics_consts::{OUT_OF_ORDER_COMPLETIONS, PARTITION_LAST_COMMITTED_OFFSET};
use crate::offsets::{OffsetManager, OffsetMarker};
use crate::types::{Partition, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetState {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OffsetEntry {
    offset: i64,
    state: OffsetState,
}

#[derive(Debug)]
struct ProgressState {
    entries: Vec<OffsetEntry>,
    last_committed_offset: i64,
}

impl ProgressState {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_committed_offset: -1,
        }
    }

    /// Flag the first in-progress entry for `offset` as completed. Returns
    /// `None` for an unknown offset, otherwise whether a lower offset is still running.
    fn complete(&mut self, offset: i64) -> Option<bool> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.offset == offset && e.state == OffsetState::InProgress)?;
        entry.state = OffsetState::Completed;

        Some(
            self.entries
                .iter()
                .any(|e| e.offset < offset && e.state == OffsetState::InProgress),
        )
    }

    /// Highest offset of the leading run of completed entries, if any.
    fn commit_candidate(&mut self) -> Option<i64> {
        self.entries.sort_by_key(|e| e.offset);
        self.entries
            .iter()
            .take_while(|e| e.state == OffsetState::Completed)
            .last()
            .map(|e| e.offset)
    }

    /// Advance `last_committed_offset` to the candidate and trim everything up
    /// to and including it. `None` when there is nothing new to commit.
    fn take_commit(&mut self) -> Option<i64> {
        let candidate = self.commit_candidate()?;
        let last_committed = self.last_committed_offset;

        // the covered prefix goes either way; only a higher offset is committed
        let covered = self
            .entries
            .iter()
            .take_while(|e| e.state == OffsetState::Completed && e.offset <= candidate)
            .count();
        self.entries.drain(..covered);

        if candidate > last_committed {
            self.last_committed_offset = candidate;
            Some(candidate)
        } else {
            None
        }
    }
}

struct PartitionProgress {
    state: Mutex<ProgressState>,
    commit_permit: Semaphore,
}

impl PartitionProgress {
    fn new() -> Self {
        Self {
            state: Mutex::new(ProgressState::new()),
            commit_permit: Semaphore::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// At-least-once commit strategy for the ordered consumer mode.
pub struct OnCompletionCommitter {
    marker: OffsetMarker,
    partitions: Mutex<HashMap<Partition, Arc<PartitionProgress>>>,
}

impl OnCompletionCommitter {
    pub fn new(marker: OffsetMarker) -> Self {
        Self {
            marker,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    fn progress(&self, partition: &Partition) -> Option<Arc<PartitionProgress>> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .cloned()
    }

    fn progress_or_create(&self, partition: &Partition) -> Arc<PartitionProgress> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(PartitionProgress::new()))
            .clone()
    }

    /// Highest offset marked for `partition`, -1 before the first commit.
    pub fn last_committed_offset(&self, partition: &Partition) -> Option<i64> {
        self.progress(partition)
            .map(|progress| progress.lock().last_committed_offset)
    }

    /// Offsets currently tracked (in progress or completed behind a gap).
    pub fn tracked_offsets(&self, partition: &Partition) -> Vec<(i64, OffsetState)> {
        self.progress(partition)
            .map(|progress| {
                progress
                    .lock()
                    .entries
                    .iter()
                    .map(|e| (e.offset, e.state))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn commit_pending(&self, partition: &Partition, progress: &PartitionProgress) {
        loop {
            let Ok(permit) = progress.commit_permit.try_acquire() else {
                // the holder picks our completion up on its next walk
                return;
            };

            loop {
                // the state lock is released before talking to the broker
                let next = progress.lock().take_commit();
                let Some(offset) = next else { break };

                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Marking offset for commit"
                );
                self.marker.mark_logged(partition, offset);
                metrics::gauge!(
                    PARTITION_LAST_COMMITTED_OFFSET,
                    "topic" => partition.topic().to_string(),
                    "partition" => partition.partition_number().to_string()
                )
                .set(offset as f64);
            }

            drop(permit);

            // a completion may have slipped in between our last walk and the release
            let mut state = progress.lock();
            match state.commit_candidate() {
                Some(candidate) if candidate > state.last_committed_offset => continue,
                _ => return,
            }
        }
    }
}

impl OffsetManager for OnCompletionCommitter {
    fn on_pull(&self, _record: &Record) {}

    fn before_handler(&self, partition: &Partition, offset: i64) {
        let progress = self.progress_or_create(partition);
        progress.lock().entries.push(OffsetEntry {
            offset,
            state: OffsetState::InProgress,
        });
    }

    fn after_handler(&self, partition: &Partition, offset: i64) {
        let Some(progress) = self.progress(partition) else {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                "Completion for untracked partition ignored"
            );
            return;
        };

        let completed = progress.lock().complete(offset);
        match completed {
            None => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Completion for unknown offset ignored"
                );
                return;
            }
            Some(true) => {
                metrics::counter!(
                    OUT_OF_ORDER_COMPLETIONS,
                    "topic" => partition.topic().to_string(),
                    "partition" => partition.partition_number().to_string()
                )
                .increment(1);
            }
            Some(false) => {}
        }

        self.commit_pending(partition, &progress);
    }

    fn on_assign(&self, partitions: &[Partition]) {
        let mut map = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        for partition in partitions {
            map.insert(partition.clone(), Arc::new(PartitionProgress::new()));
        }
    }

    fn on_revoke(&self, partitions: &[Partition]) {
        let mut map = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        for partition in partitions {
            if map.remove(partition).is_some() {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    "Cleared offset progress for revoked partition"
                );
            }
        }
    }
}
