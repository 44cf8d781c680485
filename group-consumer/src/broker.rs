//! Broker Client boundary.
//!
//! Everything below this trait (wire encoding, connection pooling, coordinator
//! lookup, assignment strategies, decompression) belongs to the broker client.
//! The consumer runtime only ever talks to the cluster through it.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::{Batch, Offset, TopicPartition};

/// Partition with the committed position the group coordinator handed out, if any
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionAssignment {
    partition: TopicPartition,
    committed: Option<Offset>,
}

impl PartitionAssignment {
    pub fn new(partition: TopicPartition, committed: Option<Offset>) -> Self {
        Self {
            partition,
            committed,
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn committed(&self) -> Option<Offset> {
        self.committed
    }
}

/// Result of a successful join/sync round with the group coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupJoin {
    pub generation_id: i32,
    pub member_id: String,
    pub leader_id: String,
    pub group_protocol: String,
    pub assignment: Vec<PartitionAssignment>,
}

impl GroupJoin {
    pub fn is_leader(&self) -> bool {
        self.member_id == self.leader_id
    }

    /// Assignment grouped by topic, partitions sorted
    pub fn member_assignment(&self) -> HashMap<String, Vec<i32>> {
        let mut by_topic: HashMap<String, Vec<i32>> = HashMap::new();
        for assigned in &self.assignment {
            by_topic
                .entry(assigned.partition().topic().to_string())
                .or_default()
                .push(assigned.partition().partition_number());
        }
        for partitions in by_topic.values_mut() {
            partitions.sort_unstable();
        }
        by_topic
    }
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Fetch the next batch for a partition starting at `from`.
    ///
    /// May return an empty batch, and may include messages below `from`.
    async fn fetch_batch(&self, partition: &TopicPartition, from: Offset)
        -> Result<Batch, BrokerError>;

    /// Commit positions (next offset to consume) for the group. Committing a
    /// position at or below the stored one is a no-op on the broker side.
    async fn commit(
        &self,
        group_id: &str,
        offsets: &HashMap<TopicPartition, Offset>,
    ) -> Result<(), BrokerError>;

    /// Join (or rejoin) the group and receive this member's assignment
    async fn join_group(&self, group_id: &str, topics: &[String])
        -> Result<GroupJoin, BrokerError>;

    async fn heartbeat(&self, group_id: &str) -> Result<(), BrokerError>;

    /// Topic names currently known to the cluster
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError>;

    /// Earliest (`from_beginning`) or latest position of a partition, used
    /// when the group has nothing committed for it yet
    async fn list_offset(
        &self,
        partition: &TopicPartition,
        from_beginning: bool,
    ) -> Result<Offset, BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_assignment_groups_by_topic() {
        let join = GroupJoin {
            generation_id: 3,
            member_id: "member-1".to_string(),
            leader_id: "member-1".to_string(),
            group_protocol: "RoundRobinAssigner".to_string(),
            assignment: vec![
                PartitionAssignment::new(TopicPartition::new("events", 2), None),
                PartitionAssignment::new(TopicPartition::new("logs", 0), Some(Offset::new(5))),
                PartitionAssignment::new(TopicPartition::new("events", 0), None),
            ],
        };

        assert!(join.is_leader());
        let assignment = join.member_assignment();
        assert_eq!(assignment.get("events"), Some(&vec![0, 2]));
        assert_eq!(assignment.get("logs"), Some(&vec![0]));
    }
}
