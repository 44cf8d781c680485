use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use group_consumer::{
    CommitPolicy, GroupJoinEvent, Message, MessageHandler, Offset, RunConfig, TopicPartition,
};

mod common;
use common::{new_consumer, Shared, seeded_broker, start, tp, wait_until, TEST_TOPIC};

/// Counts deliveries per partition and offset
#[derive(Default)]
struct DeliveryCounter {
    deliveries: Mutex<HashMap<(TopicPartition, i64), usize>>,
}

impl DeliveryCounter {
    fn count(&self, partition: &TopicPartition, offset: i64) -> usize {
        self.deliveries
            .lock()
            .unwrap()
            .get(&(partition.clone(), offset))
            .copied()
            .unwrap_or(0)
    }

    fn handled(&self, partition: &TopicPartition) -> usize {
        self.deliveries
            .lock()
            .unwrap()
            .keys()
            .filter(|(tp, _)| tp == partition)
            .count()
    }

    fn total(&self) -> usize {
        self.deliveries.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl MessageHandler for DeliveryCounter {
    async fn handle(&self, partition: &TopicPartition, message: &Message) -> anyhow::Result<()> {
        *self
            .deliveries
            .lock()
            .unwrap()
            .entry((partition.clone(), message.offset.value()))
            .or_default() += 1;
        Ok(())
    }
}

#[tokio::test]
async fn test_rebalance_flushes_revokes_and_reassigns_without_redelivery() {
    let broker = seeded_broker(4, 10);
    let consumer = new_consumer(broker.clone());
    let counter = Arc::new(DeliveryCounter::default());

    let joins: Arc<Mutex<Vec<GroupJoinEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = joins.clone();
    let _listener = consumer.on_group_join(move |event| {
        recorded.lock().unwrap().push(event.clone());
    });

    // the interval never fires during the test, so every commit below comes
    // from a rebalance or the shutdown flush
    let run = RunConfig::per_message(Shared(counter.clone()))
        .with_concurrency(2)
        .with_commit_policy(CommitPolicy::Interval(Duration::from_secs(60)));
    let task = start(consumer.clone(), run).await;

    assert!(wait_until(Duration::from_secs(5), || counter.total() == 40).await);
    assert_eq!(joins.lock().unwrap().len(), 1);
    assert_eq!(broker.committed(&tp(2)), None);

    let _paused = consumer.pause(&tp(0));

    // shrink the assignment to partitions 0 and 1
    broker.set_assignment(vec![tp(0), tp(1)]);
    broker.trigger_rebalance();
    assert!(wait_until(Duration::from_secs(5), || joins.lock().unwrap().len() == 2).await);

    for partition in 0..4 {
        assert_eq!(broker.committed(&tp(partition)), Some(Offset::new(10)));
    }
    assert_eq!(consumer.assigned_partitions(), vec![tp(0), tp(1)]);
    assert!(consumer.uncommitted_offsets().is_empty());
    assert_eq!(consumer.paused(), vec![tp(0)]);
    {
        let joins = joins.lock().unwrap();
        let event = joins.last().unwrap();
        assert_eq!(
            event.member_assignment,
            HashMap::from([(TEST_TOPIC.to_string(), vec![0, 1])])
        );
        assert!(event.is_leader);
    }

    // new data while partition 2 is away and partition 0 is paused
    broker.produce(&tp(0), Some("late-0"));
    broker.produce(&tp(2), Some("late-2"));

    broker.set_assignment(vec![tp(0), tp(1), tp(2), tp(3)]);
    broker.trigger_rebalance();
    assert!(wait_until(Duration::from_secs(5), || joins.lock().unwrap().len() == 3).await);
    assert!(wait_until(Duration::from_secs(5), || counter.count(&tp(2), 10) == 1).await);

    // partition 2 resumed at its committed position
    for offset in 0..10 {
        assert_eq!(counter.count(&tp(2), offset), 1, "offset {offset} redelivered");
    }

    // partition 0 stayed paused through both rebalances
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.handled(&tp(0)), 10);
    assert!(consumer.resume(&tp(0)));
    assert!(wait_until(Duration::from_secs(5), || counter.count(&tp(0), 10) == 1).await);

    consumer.disconnect().await.unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(broker.committed(&tp(0)), Some(Offset::new(11)));
    assert_eq!(broker.committed(&tp(2)), Some(Offset::new(11)));
}

#[tokio::test]
async fn test_fetch_reporting_rebalance_triggers_rejoin() {
    let broker = seeded_broker(1, 5);
    let consumer = new_consumer(broker.clone());
    let counter = Arc::new(DeliveryCounter::default());

    broker.fail_next_fetch(group_consumer::BrokerError::RebalanceInProgress);
    let task = start(consumer.clone(), RunConfig::per_message(Shared(counter.clone()))).await;

    assert!(wait_until(Duration::from_secs(5), || counter.total() == 5).await);
    assert_eq!(broker.join_count(), 2);

    consumer.disconnect().await.unwrap();
    task.await.unwrap().unwrap();
}
