//! Offset Tracker - Ledger of resolved and committed positions per partition
//!
//! Lanes resolve offsets concurrently while the commit scheduler snapshots and
//! marks commits. Every write is monotonic except `seek` and the clear calls,
//! which are explicit resets of a partition.
//!
//! Positions are stored as the next offset to consume (message offset + 1),
//! which is the value a commit hands to the broker.
//!
//! Every entry carries a generation that changes on `seek` and whenever the
//! entry is recreated after a clear. Resolutions and commit acknowledgements
//! taken against an older generation are refused, so neither can undo a seek.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::metrics_consts::OFFSET_TRACKER_STALE_RESOLUTION;
use crate::types::{Offset, TopicPartition};

/// Generation of positions that do not belong to any tracked entry
const UNTRACKED: u64 = 0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OffsetTrackerError {
    /// A rebalance is currently in progress - commits should be skipped
    #[error("Rebalance in progress - offset commits should be skipped")]
    RebalanceInProgress,

    /// The entry was sought or cleared since the caller read its generation
    #[error("Partition offsets were reset by a seek or revocation")]
    StaleGeneration,
}

/// State tracked per partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionOffsets {
    /// Next offset to consume after the highest resolved message
    pub resolved: Option<Offset>,
    /// Last position acknowledged by the broker
    pub committed: Option<Offset>,
    /// Resolutions that advanced `resolved` since the last commit
    pub resolutions_since_commit: u64,
    pub generation: u64,
}

/// A position taken for commit, tied to the entry state it was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPosition {
    pub position: Offset,
    generation: u64,
    /// Resolution count at the time the position was taken
    resolutions: u64,
}

impl PartitionOffsets {
    fn is_uncommitted(&self) -> bool {
        match (self.resolved, self.committed) {
            (Some(resolved), Some(committed)) => resolved > committed,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

pub struct OffsetTracker {
    partitions: DashMap<TopicPartition, PartitionOffsets>,
    rebalancing: AtomicBool,
    next_generation: AtomicU64,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            rebalancing: AtomicBool::new(false),
            next_generation: AtomicU64::new(UNTRACKED + 1),
        }
    }

    fn fresh_entry(&self) -> PartitionOffsets {
        PartitionOffsets {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            ..PartitionOffsets::default()
        }
    }

    /// Set the rebalancing flag to prevent offset commits during rebalancing
    pub fn set_rebalancing(&self, rebalancing: bool) {
        let was_rebalancing = self.rebalancing.swap(rebalancing, Ordering::SeqCst);
        if was_rebalancing != rebalancing {
            info!(
                rebalancing = rebalancing,
                "Offset tracker rebalancing state changed"
            );
        }
    }

    pub fn is_rebalancing(&self) -> bool {
        self.rebalancing.load(Ordering::SeqCst)
    }

    /// Record that the message at `offset` has been handled.
    ///
    /// Returns true if the tracked position advanced. Duplicate and
    /// out-of-order resolutions never move the position backwards.
    pub fn resolve(&self, partition: &TopicPartition, offset: Offset) -> bool {
        let mut entry = self
            .partitions
            .entry(partition.clone())
            .or_insert_with(|| self.fresh_entry());
        Self::advance(partition, &mut *entry, offset)
    }

    /// Like `resolve`, but only while the entry is still at `generation`.
    ///
    /// The check and the update happen under the entry lock, so a concurrent
    /// `seek` either lands after the resolution and overrides it, or before
    /// and makes this call fail.
    pub fn resolve_in(
        &self,
        partition: &TopicPartition,
        offset: Offset,
        generation: u64,
    ) -> Result<bool, OffsetTrackerError> {
        let Some(mut entry) = self.partitions.get_mut(partition) else {
            return Err(OffsetTrackerError::StaleGeneration);
        };
        if entry.generation != generation {
            return Err(OffsetTrackerError::StaleGeneration);
        }
        Ok(Self::advance(partition, &mut *entry, offset))
    }

    fn advance(partition: &TopicPartition, entry: &mut PartitionOffsets, offset: Offset) -> bool {
        let position = offset.next();
        match entry.resolved {
            Some(current) if position <= current => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = %offset,
                    current = %current,
                    "Ignoring resolution that does not advance position"
                );
                metrics::counter!(OFFSET_TRACKER_STALE_RESOLUTION).increment(1);
                false
            }
            _ => {
                entry.resolved = Some(position);
                entry.resolutions_since_commit += 1;
                true
            }
        }
    }

    /// Current generation of a partition's entry, creating an empty entry if
    /// none exists yet
    pub fn generation(&self, partition: &TopicPartition) -> u64 {
        self.partitions
            .entry(partition.clone())
            .or_insert_with(|| self.fresh_entry())
            .generation
    }

    /// Highest message offset resolved for a partition
    pub fn resolved_offset(&self, partition: &TopicPartition) -> Option<Offset> {
        self.resolved_position(partition).map(|p| p.prev())
    }

    /// Next offset to consume according to resolutions
    pub fn resolved_position(&self, partition: &TopicPartition) -> Option<Offset> {
        self.partitions.get(partition).and_then(|e| e.resolved)
    }

    pub fn committed_position(&self, partition: &TopicPartition) -> Option<Offset> {
        self.partitions.get(partition).and_then(|e| e.committed)
    }

    /// Where consumption of a partition should continue from, if known
    pub fn next_position(&self, partition: &TopicPartition) -> Option<Offset> {
        self.partitions
            .get(partition)
            .and_then(|e| e.resolved.or(e.committed))
    }

    pub fn get(&self, partition: &TopicPartition) -> Option<PartitionOffsets> {
        self.partitions.get(partition).map(|e| e.value().clone())
    }

    /// All partitions whose resolved position is ahead of the committed one
    pub fn snapshot_uncommitted(&self) -> HashMap<TopicPartition, Offset> {
        self.partitions
            .iter()
            .filter(|entry| entry.value().is_uncommitted())
            .filter_map(|entry| entry.value().resolved.map(|r| (entry.key().clone(), r)))
            .collect()
    }

    /// Uncommitted positions ready for a flush; refused while a rebalance is in progress
    pub fn committable_offsets(
        &self,
    ) -> Result<HashMap<TopicPartition, CommitPosition>, OffsetTrackerError> {
        if self.is_rebalancing() {
            return Err(OffsetTrackerError::RebalanceInProgress);
        }
        Ok(self
            .partitions
            .iter()
            .filter(|entry| entry.value().is_uncommitted())
            .filter_map(|entry| {
                let offsets = entry.value();
                offsets.resolved.map(|position| {
                    (
                        entry.key().clone(),
                        CommitPosition {
                            position,
                            generation: offsets.generation,
                            resolutions: offsets.resolutions_since_commit,
                        },
                    )
                })
            })
            .collect())
    }

    /// Tie an explicitly requested position to the partition's current entry
    pub fn pending_commit(&self, partition: &TopicPartition, position: Offset) -> CommitPosition {
        self.partitions.get(partition).map_or(
            CommitPosition {
                position,
                generation: UNTRACKED,
                resolutions: 0,
            },
            |entry| CommitPosition {
                position,
                generation: entry.generation,
                resolutions: entry.resolutions_since_commit,
            },
        )
    }

    /// Record a position acknowledged by the broker.
    ///
    /// Lower positions are ignored. Acknowledgements for an entry that was
    /// sought or revoked while the commit was in flight are dropped.
    pub fn mark_committed(&self, partition: &TopicPartition, commit: &CommitPosition) {
        let Some(mut entry) = self.partitions.get_mut(partition) else {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                position = %commit.position,
                "Commit acknowledged for untracked partition"
            );
            return;
        };

        if entry.generation != commit.generation {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                position = %commit.position,
                "Ignoring commit acknowledgement from before a seek"
            );
            return;
        }
        if entry.committed.is_some_and(|committed| commit.position < committed) {
            return;
        }

        entry.committed = Some(commit.position);
        if entry.resolved.map_or(true, |resolved| resolved <= commit.position) {
            entry.resolved = Some(commit.position);
            entry.resolutions_since_commit = 0;
        } else {
            // resolutions made while the commit was in flight still count
            entry.resolutions_since_commit = entry
                .resolutions_since_commit
                .saturating_sub(commit.resolutions);
        }
    }

    /// Reset a partition to an explicit position. The position becomes the
    /// next thing committed for it.
    pub fn seek(&self, partition: &TopicPartition, position: Offset) {
        self.partitions.insert(
            partition.clone(),
            PartitionOffsets {
                resolved: Some(position),
                ..self.fresh_entry()
            },
        );
    }

    /// Highest resolution count across partitions since their last commit
    pub fn max_resolutions_since_commit(&self) -> u64 {
        self.partitions
            .iter()
            .map(|e| e.value().resolutions_since_commit)
            .max()
            .unwrap_or(0)
    }

    pub fn resolutions_since_commit(&self, partition: &TopicPartition) -> u64 {
        self.partitions
            .get(partition)
            .map_or(0, |e| e.resolutions_since_commit)
    }

    /// Clear offset tracking for a partition (during revocation)
    pub fn clear_partition(&self, partition: &TopicPartition) {
        if self.partitions.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "Cleared offset tracking for revoked partition"
            );
        }
    }

    /// Clear all partitions (restart and shutdown)
    pub fn clear_all(&self) {
        self.partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}
