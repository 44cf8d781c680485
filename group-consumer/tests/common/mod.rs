//! Shared helpers for the consumer runtime integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use group_consumer::test_utils::TestBroker;
use group_consumer::{Consumer, ConsumerConfig, Result, RunConfig, Subscription, TopicPartition};
use tokio::task::JoinHandle;

pub const TEST_TOPIC: &str = "events";
pub const TEST_GROUP: &str = "integration-group";

pub fn tp(partition: i32) -> TopicPartition {
    TopicPartition::new(TEST_TOPIC, partition)
}

/// Short timings so rebalances and restarts settle within a test
pub fn consumer_config() -> ConsumerConfig {
    ConsumerConfig::new(TEST_GROUP)
        .with_heartbeat_interval(Duration::from_millis(20))
        .with_max_wait_time(Duration::from_millis(10))
        .with_restart_backoff(Duration::from_millis(10))
        .with_rebalance_backoff(Duration::from_millis(5))
}

/// Broker with one topic and `messages` messages in every partition
pub fn seeded_broker(partitions: i32, messages: usize) -> Arc<TestBroker> {
    let broker = Arc::new(TestBroker::new());
    broker.create_topic(TEST_TOPIC, partitions);
    produce(&broker, partitions, messages);
    broker
}

pub fn produce(broker: &TestBroker, partitions: i32, messages: usize) {
    for partition in 0..partitions {
        for i in 0..messages {
            broker.produce(&tp(partition), Some(format!("p{partition}-m{i}")));
        }
    }
}

pub fn new_consumer(broker: Arc<TestBroker>) -> Arc<Consumer> {
    Arc::new(Consumer::new(consumer_config(), broker).unwrap())
}

/// Connect, subscribe from the beginning and run in the background
pub async fn start(consumer: Arc<Consumer>, run: RunConfig) -> JoinHandle<Result<()>> {
    consumer.connect().await.unwrap();
    consumer
        .subscribe(Subscription::new().topic(TEST_TOPIC).from_beginning(true))
        .await
        .unwrap();

    tokio::spawn(async move { consumer.run(run).await })
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Lets a handler be shared with the test body; integration tests cannot
/// implement the handler traits on `Arc<T>` directly (orphan rule)
pub struct Shared<T>(pub Arc<T>);

#[async_trait::async_trait]
impl<T: group_consumer::MessageHandler> group_consumer::MessageHandler for Shared<T> {
    async fn handle(
        &self,
        partition: &TopicPartition,
        message: &group_consumer::Message,
    ) -> anyhow::Result<()> {
        group_consumer::MessageHandler::handle(&*self.0, partition, message).await
    }
}

#[async_trait::async_trait]
impl<T: group_consumer::BatchHandler> group_consumer::BatchHandler for Shared<T> {
    async fn handle(
        &self,
        batch: &group_consumer::Batch,
        control: &group_consumer::BatchControl,
    ) -> anyhow::Result<()> {
        group_consumer::BatchHandler::handle(&*self.0, batch, control).await
    }
}
