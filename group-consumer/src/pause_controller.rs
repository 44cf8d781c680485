//! Pause/Stale Controller - per-partition flow control shared with the lanes
//!
//! Every assigned partition gets a `PartitionControl` carrying a stale epoch,
//! a pending seek target and a revoked flag. Lanes read it between handler
//! invocations; callers write it through `PauseController` at any time.
//! Pausing is tracked separately from assignment so it survives rebalances.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::{DashMap, DashSet};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{ConsumerError, Result};
use crate::offset_tracker::OffsetTracker;
use crate::types::{Offset, TopicPartition};

const NO_SEEK: i64 = i64::MIN;

pub struct PartitionControl {
    partition: TopicPartition,
    epoch: AtomicU64,
    pending_seek: AtomicI64,
    revoked: AtomicBool,
}

impl PartitionControl {
    fn new(partition: TopicPartition) -> Self {
        Self {
            partition,
            epoch: AtomicU64::new(0),
            pending_seek: AtomicI64::new(NO_SEEK),
            revoked: AtomicBool::new(false),
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Bumped on every seek and on revocation; work started under an older
    /// epoch is stale
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_stale(&self, since_epoch: u64) -> bool {
        self.is_revoked() || self.epoch() != since_epoch
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    pub fn take_seek(&self) -> Option<Offset> {
        match self.pending_seek.swap(NO_SEEK, Ordering::SeqCst) {
            NO_SEEK => None,
            target => Some(Offset::new(target)),
        }
    }

    fn request_seek(&self, target: Offset) {
        self.pending_seek.store(target.value(), Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct PauseController {
    assigned: DashMap<TopicPartition, Arc<PartitionControl>>,
    paused: DashSet<TopicPartition>,
    tracker: Arc<OffsetTracker>,
    wake: Notify,
}

impl PauseController {
    pub fn new(tracker: Arc<OffsetTracker>) -> Self {
        Self {
            assigned: DashMap::new(),
            paused: DashSet::new(),
            tracker,
            wake: Notify::new(),
        }
    }

    /// Register an assigned partition, reusing its control if it is already known
    pub fn assign(&self, partition: &TopicPartition) -> Arc<PartitionControl> {
        self.assigned
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(PartitionControl::new(partition.clone())))
            .clone()
    }

    /// Mark a partition revoked; in-flight work against it becomes stale
    pub fn revoke(&self, partition: &TopicPartition) {
        if let Some((_, control)) = self.assigned.remove(partition) {
            control.revoke();
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Revoked partition control"
            );
        }
    }

    pub fn revoke_all(&self) {
        let partitions = self.assigned_partitions();
        for partition in &partitions {
            self.revoke(partition);
        }
    }

    pub fn control(&self, partition: &TopicPartition) -> Option<Arc<PartitionControl>> {
        self.assigned.get(partition).map(|c| c.value().clone())
    }

    pub fn is_assigned(&self, partition: &TopicPartition) -> bool {
        self.assigned.contains_key(partition)
    }

    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<_> = self.assigned.iter().map(|e| e.key().clone()).collect();
        partitions.sort();
        partitions
    }

    /// Stop dispatching a partition until the returned handle (or `resume`) is used
    pub fn pause(self: &Arc<Self>, partition: &TopicPartition) -> ResumeHandle {
        if self.paused.insert(partition.clone()) {
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Paused partition"
            );
        }
        ResumeHandle {
            partition: partition.clone(),
            controller: Arc::downgrade(self),
        }
    }

    /// Returns false if the partition was not paused
    pub fn resume(&self, partition: &TopicPartition) -> bool {
        let resumed = self.paused.remove(partition).is_some();
        if resumed {
            info!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Resumed partition"
            );
            self.wake.notify_waiters();
        }
        resumed
    }

    pub fn is_paused(&self, partition: &TopicPartition) -> bool {
        self.paused.contains(partition)
    }

    pub fn paused(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<_> = self.paused.iter().map(|p| p.key().clone()).collect();
        partitions.sort();
        partitions
    }

    /// Move the read position of an assigned partition.
    ///
    /// The in-flight batch (if any) becomes stale, the next fetch starts at
    /// `offset`, and `offset` becomes the partition's next commit.
    pub fn seek(&self, partition: &TopicPartition, offset: Offset) -> Result<()> {
        let control = self
            .control(partition)
            .ok_or_else(|| ConsumerError::NotAssigned(partition.clone()))?;

        control.request_seek(offset);
        self.tracker.seek(partition, offset);
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            offset = %offset,
            "Seek requested"
        );
        self.wake.notify_waiters();
        Ok(())
    }

    /// Wake lanes waiting for data, e.g. on shutdown or rebalance
    pub fn wake_all(&self) {
        self.wake.notify_waiters();
    }

    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.wake.notified()
    }
}

/// Capability returned by `pause`; resuming consumes it
#[derive(Debug)]
pub struct ResumeHandle {
    partition: TopicPartition,
    controller: Weak<PauseController>,
}

impl ResumeHandle {
    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Resume the partition. A no-op once the consumer is gone.
    pub fn resume(self) -> bool {
        match self.controller.upgrade() {
            Some(controller) => controller.resume(&self.partition),
            None => false,
        }
    }
}

impl std::fmt::Debug for PauseController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseController")
            .field("assigned", &self.assigned_partitions())
            .field("paused", &self.paused())
            .finish()
    }
}
