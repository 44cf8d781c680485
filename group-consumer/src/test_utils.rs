//! In-memory broker for tests.
//!
//! `TestBroker` keeps one message log per partition and the group's
//! committed positions, and lets tests script assignments and inject the
//! failures a real cluster produces (rebalances, session expiry, failed
//! commits and fetches).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::broker::{BrokerClient, GroupJoin, PartitionAssignment};
use crate::error::BrokerError;
use crate::types::{Batch, Message, Offset, TopicPartition};

pub const TEST_MEMBER_ID: &str = "test-member";
pub const TEST_GROUP_PROTOCOL: &str = "RoundRobinAssigner";

pub struct TestBroker {
    logs: Mutex<BTreeMap<TopicPartition, Vec<Message>>>,
    committed: Mutex<HashMap<TopicPartition, Offset>>,
    assignment: Mutex<Option<Vec<TopicPartition>>>,
    max_batch_size: AtomicUsize,

    rebalance_pending: AtomicBool,
    session_expired: AtomicBool,
    commit_failures: Mutex<VecDeque<BrokerError>>,
    fetch_failures: Mutex<VecDeque<BrokerError>>,
    commits_held: AtomicBool,
    held_commits: AtomicUsize,
    commit_release: Notify,

    connected: AtomicBool,
    connects: AtomicUsize,
    joins: AtomicUsize,
    heartbeats: AtomicUsize,
    commits: AtomicUsize,
    recording_fetches: AtomicBool,
    fetches: Mutex<Vec<(TopicPartition, Offset)>>,
}

impl Default for TestBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBroker {
    pub fn new() -> Self {
        Self {
            logs: Mutex::new(BTreeMap::new()),
            committed: Mutex::new(HashMap::new()),
            assignment: Mutex::new(None),
            max_batch_size: AtomicUsize::new(100),
            rebalance_pending: AtomicBool::new(false),
            session_expired: AtomicBool::new(false),
            commit_failures: Mutex::new(VecDeque::new()),
            fetch_failures: Mutex::new(VecDeque::new()),
            commits_held: AtomicBool::new(false),
            held_commits: AtomicUsize::new(0),
            commit_release: Notify::new(),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            joins: AtomicUsize::new(0),
            heartbeats: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            recording_fetches: AtomicBool::new(false),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut logs = self.logs.lock().unwrap();
        for partition in 0..partitions {
            logs.entry(TopicPartition::new(topic, partition)).or_default();
        }
    }

    /// Append a message and return its offset
    pub fn produce<V: Into<Bytes>>(&self, partition: &TopicPartition, value: Option<V>) -> Offset {
        let mut logs = self.logs.lock().unwrap();
        let log = logs.entry(partition.clone()).or_default();
        let offset = Offset::new(log.len() as i64);
        log.push(Message::new(offset, value.map(Into::into)));
        offset
    }

    pub fn high_watermark(&self, partition: &TopicPartition) -> Offset {
        let logs = self.logs.lock().unwrap();
        Offset::new(logs.get(partition).map_or(0, |log| log.len() as i64))
    }

    pub fn set_max_batch_size(&self, size: usize) {
        self.max_batch_size.store(size.max(1), Ordering::SeqCst);
    }

    /// Fix the partitions handed out by subsequent joins. Without a script a
    /// join assigns every partition of the requested topics.
    pub fn set_assignment(&self, partitions: Vec<TopicPartition>) {
        *self.assignment.lock().unwrap() = Some(partitions);
    }

    /// Heartbeats report a rebalance until the next join
    pub fn trigger_rebalance(&self) {
        self.rebalance_pending.store(true, Ordering::SeqCst);
    }

    /// The next heartbeat reports an expired session
    pub fn expire_session(&self) {
        self.session_expired.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_commit(&self, error: BrokerError) {
        self.commit_failures.lock().unwrap().push_back(error);
    }

    /// Commits block until [`TestBroker::release_commits`]
    pub fn hold_commits(&self) {
        self.commits_held.store(true, Ordering::SeqCst);
    }

    pub fn release_commits(&self) {
        self.commits_held.store(false, Ordering::SeqCst);
        self.commit_release.notify_waiters();
    }

    /// Commits that have blocked on the hold so far
    pub fn held_commit_count(&self) -> usize {
        self.held_commits.load(Ordering::SeqCst)
    }

    pub fn fail_next_fetch(&self, error: BrokerError) {
        self.fetch_failures.lock().unwrap().push_back(error);
    }

    pub fn set_committed(&self, partition: &TopicPartition, position: Offset) {
        self.committed.lock().unwrap().insert(partition.clone(), position);
    }

    pub fn committed(&self, partition: &TopicPartition) -> Option<Offset> {
        self.committed.lock().unwrap().get(partition).copied()
    }

    /// Start (or restart) recording fetch positions
    pub fn record_fetches(&self) {
        self.fetches.lock().unwrap().clear();
        self.recording_fetches.store(true, Ordering::SeqCst);
    }

    pub fn fetch_log(&self) -> Vec<(TopicPartition, Offset)> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn join_count(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Successful commit calls
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerClient for TestBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connected.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_batch(
        &self,
        partition: &TopicPartition,
        from: Offset,
    ) -> Result<Batch, BrokerError> {
        if let Some(error) = self.fetch_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if self.recording_fetches.load(Ordering::SeqCst) {
            self.fetches.lock().unwrap().push((partition.clone(), from));
        }

        let logs = self.logs.lock().unwrap();
        let log = logs
            .get(partition)
            .ok_or_else(|| BrokerError::UnknownTopicOrPartition(partition.clone()))?;

        let start = usize::try_from(from.value()).unwrap_or(0).min(log.len());
        let end = (start + self.max_batch_size.load(Ordering::SeqCst)).min(log.len());
        Ok(Batch::new(
            partition.clone(),
            from,
            Offset::new(log.len() as i64),
            log[start..end].to_vec(),
        ))
    }

    async fn commit(
        &self,
        _group_id: &str,
        offsets: &HashMap<TopicPartition, Offset>,
    ) -> Result<(), BrokerError> {
        let mut counted = false;
        loop {
            let released = self.commit_release.notified();
            if !self.commits_held.load(Ordering::SeqCst) {
                break;
            }
            if !counted {
                self.held_commits.fetch_add(1, Ordering::SeqCst);
                counted = true;
            }
            released.await;
        }

        if let Some(error) = self.commit_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut committed = self.committed.lock().unwrap();
        for (partition, position) in offsets {
            let current = committed.entry(partition.clone()).or_insert(*position);
            if *position > *current {
                *current = *position;
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn join_group(&self, _group_id: &str, topics: &[String]) -> Result<GroupJoin, BrokerError> {
        self.rebalance_pending.store(false, Ordering::SeqCst);
        let generation = self.joins.fetch_add(1, Ordering::SeqCst) + 1;

        let partitions = match self.assignment.lock().unwrap().clone() {
            Some(scripted) => scripted,
            None => self
                .logs
                .lock()
                .unwrap()
                .keys()
                .filter(|tp| topics.iter().any(|t| t == tp.topic()))
                .cloned()
                .collect(),
        };

        let committed = self.committed.lock().unwrap();
        Ok(GroupJoin {
            generation_id: i32::try_from(generation).unwrap_or(i32::MAX),
            member_id: TEST_MEMBER_ID.to_string(),
            leader_id: TEST_MEMBER_ID.to_string(),
            group_protocol: TEST_GROUP_PROTOCOL.to_string(),
            assignment: partitions
                .into_iter()
                .map(|tp| {
                    let position = committed.get(&tp).copied();
                    PartitionAssignment::new(tp, position)
                })
                .collect(),
        })
    }

    async fn heartbeat(&self, _group_id: &str) -> Result<(), BrokerError> {
        if self.session_expired.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::SessionExpired);
        }
        if self.rebalance_pending.load(Ordering::SeqCst) {
            return Err(BrokerError::RebalanceInProgress);
        }
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let logs = self.logs.lock().unwrap();
        let mut topics: Vec<String> = logs.keys().map(|tp| tp.topic().to_string()).collect();
        topics.dedup();
        Ok(topics)
    }

    async fn list_offset(
        &self,
        partition: &TopicPartition,
        from_beginning: bool,
    ) -> Result<Offset, BrokerError> {
        if from_beginning {
            Ok(Offset::ZERO)
        } else {
            Ok(self.high_watermark(partition))
        }
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_returns_log_slice() {
        let broker = TestBroker::new();
        let tp = TopicPartition::new("events", 0);
        broker.create_topic("events", 1);
        for i in 0..30 {
            broker.produce(&tp, Some(format!("m{i}")));
        }
        broker.set_max_batch_size(10);

        let batch = broker.fetch_batch(&tp, Offset::new(10)).await.unwrap();

        assert_eq!(batch.first_offset(), Some(Offset::new(10)));
        assert_eq!(batch.last_offset(), Some(Offset::new(19)));
        assert_eq!(batch.high_watermark(), Offset::new(30));
        assert_eq!(batch.offset_lag(), 10);
    }

    #[tokio::test]
    async fn test_commit_never_regresses() {
        let broker = TestBroker::new();
        let tp = TopicPartition::new("events", 0);

        broker.commit("g", &HashMap::from([(tp.clone(), Offset::new(10))])).await.unwrap();
        broker.commit("g", &HashMap::from([(tp.clone(), Offset::new(4))])).await.unwrap();

        assert_eq!(broker.committed(&tp), Some(Offset::new(10)));
    }

    #[tokio::test]
    async fn test_join_assigns_subscribed_topics_with_committed_positions() {
        let broker = TestBroker::new();
        broker.create_topic("events", 2);
        broker.create_topic("other", 1);
        broker.set_committed(&TopicPartition::new("events", 1), Offset::new(7));
        broker.trigger_rebalance();

        let join = broker.join_group("g", &["events".to_string()]).await.unwrap();

        assert_eq!(join.assignment.len(), 2);
        assert_eq!(join.assignment[1].committed(), Some(Offset::new(7)));
        assert!(join.is_leader());
        // joining settles the pending rebalance
        assert!(broker.heartbeat("g").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_topics_is_deduplicated() {
        let broker = TestBroker::new();
        broker.create_topic("a", 3);
        broker.create_topic("b", 1);

        assert_eq!(broker.list_topics().await.unwrap(), vec!["a", "b"]);
    }
}
