//! Commit Scheduler - decides when resolved offsets are flushed to the broker
//!
//! A flush takes the offset tracker snapshot, commits it through the broker
//! client and marks the acknowledged positions. Flushes are serialized so two
//! lanes hitting a threshold at once produce a single commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::error::{BrokerError, ConsumerError, Result};
use crate::metrics_consts::{OFFSET_COMMITS, PARTITION_LAST_COMMITTED_OFFSET};
use crate::offset_tracker::{CommitPosition, OffsetTracker};
use crate::types::{Offset, TopicPartition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Only explicit `commit_offsets` calls reach the broker
    Manual,
    Interval(Duration),
    /// Flush once a partition accumulates this many resolutions
    Threshold(u64),
    IntervalAndThreshold {
        interval: Duration,
        threshold: u64,
    },
}

impl Default for CommitPolicy {
    fn default() -> Self {
        CommitPolicy::Interval(Duration::from_secs(5))
    }
}

impl CommitPolicy {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            CommitPolicy::Interval(interval)
            | CommitPolicy::IntervalAndThreshold { interval, .. } => Some(*interval),
            _ => None,
        }
    }

    pub fn threshold(&self) -> Option<u64> {
        match self {
            CommitPolicy::Threshold(threshold)
            | CommitPolicy::IntervalAndThreshold { threshold, .. } => Some(*threshold),
            _ => None,
        }
    }

    pub fn is_automatic(&self) -> bool {
        !matches!(self, CommitPolicy::Manual)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval().is_some_and(|i| i.is_zero()) {
            return Err(ConsumerError::Config(
                "auto commit interval must be greater than zero".to_string(),
            ));
        }
        if self.threshold() == Some(0) {
            return Err(ConsumerError::Config(
                "auto commit threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// What caused a flush, used for logs and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTrigger {
    Manual,
    Interval,
    Threshold,
    Rebalance,
    Shutdown,
    Crash,
}

impl CommitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitTrigger::Manual => "manual",
            CommitTrigger::Interval => "interval",
            CommitTrigger::Threshold => "threshold",
            CommitTrigger::Rebalance => "rebalance",
            CommitTrigger::Shutdown => "shutdown",
            CommitTrigger::Crash => "crash",
        }
    }
}

pub struct CommitScheduler {
    group_id: String,
    policy: CommitPolicy,
    tracker: Arc<OffsetTracker>,
    broker: Arc<dyn BrokerClient>,
    started: Instant,
    /// Millis since `started` of the last flush; resets the interval timer
    last_flush_ms: AtomicU64,
    flush_lock: Mutex<()>,
}

impl CommitScheduler {
    pub fn new(
        group_id: impl Into<String>,
        policy: CommitPolicy,
        tracker: Arc<OffsetTracker>,
        broker: Arc<dyn BrokerClient>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            policy,
            tracker,
            broker,
            started: Instant::now(),
            last_flush_ms: AtomicU64::new(0),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> CommitPolicy {
        self.policy
    }

    pub fn tracker(&self) -> &Arc<OffsetTracker> {
        &self.tracker
    }

    /// Explicit commit. `None` (or an empty map) commits everything resolved;
    /// a non-empty map is committed as given, regardless of resolved state.
    pub async fn commit(&self, offsets: Option<HashMap<TopicPartition, Offset>>) -> Result<usize> {
        match offsets {
            Some(offsets) if !offsets.is_empty() => self.commit_explicit(offsets).await,
            _ => self.flush(CommitTrigger::Manual).await,
        }
    }

    async fn commit_explicit(&self, offsets: HashMap<TopicPartition, Offset>) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;
        let commits = offsets
            .into_iter()
            .map(|(partition, position)| {
                let commit = self.tracker.pending_commit(&partition, position);
                (partition, commit)
            })
            .collect();
        self.send(&commits, CommitTrigger::Manual).await
    }

    /// Commit the uncommitted snapshot. Returns how many partitions were committed.
    pub async fn flush(&self, trigger: CommitTrigger) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;

        let commits = match self.tracker.committable_offsets() {
            Ok(commits) => commits,
            // the tracker only refuses snapshots while rebalancing
            Err(e) => {
                debug!(
                    group_id = %self.group_id,
                    trigger = trigger.as_str(),
                    error = ?e,
                    "Skipping offset commit during rebalance"
                );
                return Err(ConsumerError::CommitFailure(
                    BrokerError::RebalanceInProgress,
                ));
            }
        };

        if commits.is_empty() {
            self.reset_timer();
            return Ok(0);
        }

        self.send(&commits, trigger).await
    }

    async fn send(
        &self,
        commits: &HashMap<TopicPartition, CommitPosition>,
        trigger: CommitTrigger,
    ) -> Result<usize> {
        let offsets: HashMap<TopicPartition, Offset> = commits
            .iter()
            .map(|(partition, commit)| (partition.clone(), commit.position))
            .collect();

        match self.broker.commit(&self.group_id, &offsets).await {
            Ok(()) => {
                // acknowledgements for partitions sought meanwhile are dropped by the tracker
                for (partition, commit) in commits {
                    self.tracker.mark_committed(partition, commit);
                    metrics::gauge!(
                        PARTITION_LAST_COMMITTED_OFFSET,
                        "topic" => partition.topic().to_string(),
                        "partition" => partition.partition_number().to_string()
                    )
                    .set(commit.position.value() as f64);
                }
                self.reset_timer();
                metrics::counter!(
                    OFFSET_COMMITS,
                    "outcome" => "success",
                    "trigger" => trigger.as_str()
                )
                .increment(1);
                debug!(
                    group_id = %self.group_id,
                    trigger = trigger.as_str(),
                    partitions = offsets.len(),
                    "Committed offsets"
                );
                Ok(offsets.len())
            }
            Err(e) => {
                // the next automatic attempt waits a full interval
                self.reset_timer();
                metrics::counter!(
                    OFFSET_COMMITS,
                    "outcome" => "failure",
                    "trigger" => trigger.as_str()
                )
                .increment(1);
                warn!(
                    group_id = %self.group_id,
                    trigger = trigger.as_str(),
                    partitions = offsets.len(),
                    error = ?e,
                    "Offset commit failed - resolved offsets kept for retry"
                );
                Err(ConsumerError::CommitFailure(e))
            }
        }
    }

    /// Which automatic trigger is currently satisfied, if any
    pub fn due_trigger(&self) -> Option<CommitTrigger> {
        if let Some(threshold) = self.policy.threshold() {
            if self.tracker.max_resolutions_since_commit() >= threshold {
                return Some(CommitTrigger::Threshold);
            }
        }
        if let Some(interval) = self.policy.interval() {
            if self.since_last_flush() >= interval {
                return Some(CommitTrigger::Interval);
            }
        }
        None
    }

    /// Flush if the policy says so. Returns whether a commit happened.
    pub async fn commit_if_necessary(&self) -> Result<bool> {
        match self.due_trigger() {
            Some(trigger) => Ok(self.flush(trigger).await? > 0),
            None => Ok(false),
        }
    }

    /// Time left until the interval timer fires, `None` without an interval policy
    pub fn time_until_interval(&self) -> Option<Duration> {
        self.policy
            .interval()
            .map(|interval| interval.saturating_sub(self.since_last_flush()))
    }

    /// Final flush before revocation, shutdown or a crash restart; manual
    /// policies commit nothing
    pub async fn flush_before(&self, trigger: CommitTrigger) {
        if !self.policy.is_automatic() {
            return;
        }
        match self.flush(trigger).await {
            Ok(0) => {}
            Ok(partitions) => info!(
                group_id = %self.group_id,
                trigger = trigger.as_str(),
                partitions = partitions,
                "Flushed resolved offsets"
            ),
            Err(e) => warn!(
                group_id = %self.group_id,
                trigger = trigger.as_str(),
                error = ?e,
                "Could not flush resolved offsets"
            ),
        }
    }

    fn since_last_flush(&self) -> Duration {
        let last = Duration::from_millis(self.last_flush_ms.load(Ordering::SeqCst));
        self.started.elapsed().saturating_sub(last)
    }

    fn reset_timer(&self) {
        let now = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_flush_ms.store(now, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::GroupJoin;
    use crate::test_utils::TestBroker;
    use crate::types::Batch;
    use async_trait::async_trait;
    use mockall::mock;
    use test_case::test_case;

    mock! {
        pub Broker {}

        #[async_trait]
        impl BrokerClient for Broker {
            async fn connect(&self) -> Result<(), BrokerError>;
            async fn fetch_batch(&self, partition: &TopicPartition, from: Offset) -> Result<Batch, BrokerError>;
            async fn commit(&self, group_id: &str, offsets: &HashMap<TopicPartition, Offset>) -> Result<(), BrokerError>;
            async fn join_group(&self, group_id: &str, topics: &[String]) -> Result<GroupJoin, BrokerError>;
            async fn heartbeat(&self, group_id: &str) -> Result<(), BrokerError>;
            async fn list_topics(&self) -> Result<Vec<String>, BrokerError>;
            async fn list_offset(&self, partition: &TopicPartition, from_beginning: bool) -> Result<Offset, BrokerError>;
            async fn disconnect(&self) -> Result<(), BrokerError>;
        }
    }

    fn partition(num: i32) -> TopicPartition {
        TopicPartition::new("test-topic", num)
    }

    fn scheduler(policy: CommitPolicy, broker: MockBroker) -> CommitScheduler {
        CommitScheduler::new(
            "test-group",
            policy,
            Arc::new(OffsetTracker::new()),
            Arc::new(broker),
        )
    }

    #[test_case(CommitPolicy::Interval(Duration::ZERO) ; "zero interval")]
    #[test_case(CommitPolicy::Threshold(0) ; "zero threshold")]
    #[test_case(CommitPolicy::IntervalAndThreshold { interval: Duration::from_secs(1), threshold: 0 } ; "combined zero threshold")]
    fn test_invalid_policies_are_rejected(policy: CommitPolicy) {
        assert!(matches!(policy.validate(), Err(ConsumerError::Config(_))));
    }

    #[tokio::test]
    async fn test_manual_policy_never_due() {
        let mut broker = MockBroker::new();
        broker.expect_commit().never();
        let scheduler = scheduler(CommitPolicy::Manual, broker);

        for offset in 0..100 {
            scheduler.tracker().resolve(&partition(0), Offset::new(offset));
        }

        assert_eq!(scheduler.due_trigger(), None);
        assert!(!scheduler.commit_if_necessary().await.unwrap());
    }

    #[tokio::test]
    async fn test_manual_commit_flushes_snapshot() {
        let mut broker = MockBroker::new();
        broker
            .expect_commit()
            .withf(|group_id, offsets| {
                group_id == "test-group"
                    && offsets.len() == 1
                    && offsets.get(&TopicPartition::new("test-topic", 0)) == Some(&Offset::new(8))
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let scheduler = scheduler(CommitPolicy::Manual, broker);

        scheduler.tracker().resolve(&partition(0), Offset::new(7));
        assert_eq!(scheduler.commit(None).await.unwrap(), 1);

        assert_eq!(
            scheduler.tracker().committed_position(&partition(0)),
            Some(Offset::new(8))
        );
        // nothing left to commit, so no second broker call
        assert_eq!(scheduler.commit(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_explicit_commit_bypasses_resolved_state() {
        let mut broker = MockBroker::new();
        broker
            .expect_commit()
            .withf(|_, offsets| offsets.get(&TopicPartition::new("test-topic", 1)) == Some(&Offset::new(500)))
            .times(1)
            .returning(|_, _| Ok(()));
        let scheduler = scheduler(CommitPolicy::Manual, broker);

        scheduler.tracker().resolve(&partition(1), Offset::new(9));
        let explicit = HashMap::from([(partition(1), Offset::new(500))]);
        scheduler.commit(Some(explicit)).await.unwrap();

        let entry = scheduler.tracker().get(&partition(1)).unwrap();
        assert_eq!(entry.committed, Some(Offset::new(500)));
        assert_eq!(entry.resolved, Some(Offset::new(500)));
    }

    #[tokio::test]
    async fn test_explicit_commit_below_committed_does_not_regress() {
        let mut broker = MockBroker::new();
        broker.expect_commit().times(2).returning(|_, _| Ok(()));
        let scheduler = scheduler(CommitPolicy::Manual, broker);

        scheduler.tracker().resolve(&partition(0), Offset::new(99));
        scheduler.commit(None).await.unwrap();

        let lower = HashMap::from([(partition(0), Offset::new(10))]);
        scheduler.commit(Some(lower)).await.unwrap();

        assert_eq!(
            scheduler.tracker().committed_position(&partition(0)),
            Some(Offset::new(100))
        );
    }

    #[tokio::test]
    async fn test_threshold_flushes_after_exact_count() {
        let mut broker = MockBroker::new();
        broker.expect_commit().times(1).returning(|_, _| Ok(()));
        let scheduler = scheduler(CommitPolicy::Threshold(5), broker);

        for offset in 0..4 {
            scheduler.tracker().resolve(&partition(0), Offset::new(offset));
            assert!(!scheduler.commit_if_necessary().await.unwrap());
        }

        scheduler.tracker().resolve(&partition(0), Offset::new(4));
        assert_eq!(scheduler.due_trigger(), Some(CommitTrigger::Threshold));
        assert!(scheduler.commit_if_necessary().await.unwrap());
        assert_eq!(
            scheduler.tracker().committed_position(&partition(0)),
            Some(Offset::new(5))
        );

        scheduler.tracker().resolve(&partition(0), Offset::new(5));
        assert_eq!(scheduler.due_trigger(), None);
    }

    #[tokio::test]
    async fn test_threshold_counts_per_partition() {
        let mut broker = MockBroker::new();
        broker.expect_commit().never();
        let scheduler = scheduler(CommitPolicy::Threshold(3), broker);

        // two resolutions on each of two partitions: four overall, none reach three
        for p in 0..2 {
            for offset in 0..2 {
                scheduler.tracker().resolve(&partition(p), Offset::new(offset));
            }
        }

        assert_eq!(scheduler.due_trigger(), None);
    }

    #[tokio::test]
    async fn test_interval_due_after_elapsed() {
        let mut broker = MockBroker::new();
        broker.expect_commit().times(1).returning(|_, _| Ok(()));
        let scheduler = scheduler(CommitPolicy::Interval(Duration::from_millis(30)), broker);

        scheduler.tracker().resolve(&partition(0), Offset::new(0));
        assert_eq!(scheduler.due_trigger(), None);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(scheduler.due_trigger(), Some(CommitTrigger::Interval));
        assert!(scheduler.commit_if_necessary().await.unwrap());

        // flushing resets the timer
        assert_eq!(scheduler.due_trigger(), None);
        assert!(scheduler.time_until_interval().unwrap() > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_threshold_flush_restarts_interval_timer() {
        let mut broker = MockBroker::new();
        broker.expect_commit().times(1).returning(|_, _| Ok(()));
        let policy = CommitPolicy::IntervalAndThreshold {
            interval: Duration::from_millis(200),
            threshold: 3,
        };
        let scheduler = scheduler(policy, broker);

        tokio::time::sleep(Duration::from_millis(100)).await;
        for offset in 0..3 {
            scheduler.tracker().resolve(&partition(0), Offset::new(offset));
        }
        assert_eq!(scheduler.due_trigger(), Some(CommitTrigger::Threshold));
        assert!(scheduler.commit_if_necessary().await.unwrap());

        assert!(scheduler.time_until_interval().unwrap() > Duration::from_millis(150));

        // past the original deadline, but not a full interval after the flush
        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.tracker().resolve(&partition(0), Offset::new(3));
        assert_eq!(scheduler.due_trigger(), None);
    }

    #[tokio::test]
    async fn test_interval_flush_restarts_threshold_count() {
        let mut broker = MockBroker::new();
        broker.expect_commit().times(1).returning(|_, _| Ok(()));
        let policy = CommitPolicy::IntervalAndThreshold {
            interval: Duration::from_millis(30),
            threshold: 10,
        };
        let scheduler = scheduler(policy, broker);

        for offset in 0..4 {
            scheduler.tracker().resolve(&partition(0), Offset::new(offset));
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(scheduler.due_trigger(), Some(CommitTrigger::Interval));
        assert!(scheduler.commit_if_necessary().await.unwrap());
        assert_eq!(scheduler.tracker().max_resolutions_since_commit(), 0);

        // thirteen resolutions overall, nine since the flush
        for offset in 4..13 {
            scheduler.tracker().resolve(&partition(0), Offset::new(offset));
        }
        assert_eq!(scheduler.due_trigger(), None);
    }

    #[tokio::test]
    async fn test_commit_acknowledged_after_seek_keeps_seek_position() {
        let broker = Arc::new(TestBroker::new());
        let tracker = Arc::new(OffsetTracker::new());
        let scheduler = Arc::new(CommitScheduler::new(
            "test-group",
            CommitPolicy::Manual,
            tracker.clone(),
            broker.clone(),
        ));

        tracker.resolve(&partition(0), Offset::new(29));
        broker.hold_commits();
        let flushing = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.commit(None).await }
        });
        while broker.held_commit_count() == 0 {
            tokio::task::yield_now().await;
        }

        tracker.seek(&partition(0), Offset::new(15));
        broker.release_commits();
        assert_eq!(flushing.await.unwrap().unwrap(), 1);

        assert_eq!(broker.committed(&partition(0)), Some(Offset::new(30)));
        // the late acknowledgement must not move the partition past 15
        assert_eq!(tracker.resolved_position(&partition(0)), Some(Offset::new(15)));
        assert_eq!(tracker.committed_position(&partition(0)), None);
        assert_eq!(
            tracker.snapshot_uncommitted().get(&partition(0)),
            Some(&Offset::new(15))
        );
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_resolved_state() {
        let mut broker = MockBroker::new();
        let mut calls = 0;
        broker.expect_commit().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(BrokerError::Connectivity("connection reset".to_string()))
            } else {
                Ok(())
            }
        });
        let scheduler = scheduler(CommitPolicy::Threshold(1), broker);

        scheduler.tracker().resolve(&partition(0), Offset::new(41));
        let result = scheduler.commit_if_necessary().await;
        assert!(matches!(result, Err(ConsumerError::CommitFailure(_))));
        assert_eq!(
            scheduler.tracker().snapshot_uncommitted().get(&partition(0)),
            Some(&Offset::new(42))
        );

        // retried on the next trigger with the same position
        assert!(scheduler.commit_if_necessary().await.unwrap());
        assert_eq!(
            scheduler.tracker().committed_position(&partition(0)),
            Some(Offset::new(42))
        );
    }

    #[tokio::test]
    async fn test_flush_refused_during_rebalance() {
        let mut broker = MockBroker::new();
        broker.expect_commit().never();
        let scheduler = scheduler(CommitPolicy::Threshold(1), broker);

        scheduler.tracker().resolve(&partition(0), Offset::new(1));
        scheduler.tracker().set_rebalancing(true);

        let result = scheduler.flush(CommitTrigger::Threshold).await;
        assert!(matches!(
            result,
            Err(ConsumerError::CommitFailure(BrokerError::RebalanceInProgress))
        ));
    }
}
