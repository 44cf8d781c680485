use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;

use crate::commit_scheduler::CommitPolicy;
use crate::error::{ConsumerError, Result};
use crate::partition_dispatcher::{BatchHandler, HandlerMode, MessageHandler};
use crate::subscription::{Subscription, TopicSelector};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    pub kafka_consumer_group: String,

    // Comma separated, `/regex/` entries are patterns
    pub kafka_consumer_topics: String,

    #[envconfig(default = "false")]
    pub kafka_consumer_from_beginning: bool,

    #[envconfig(default = "1")]
    pub partitions_consumed_concurrently: usize,

    #[envconfig(default = "true")]
    pub auto_commit: bool,

    #[envconfig(default = "5000")] // 0 disables the interval trigger
    pub auto_commit_interval_ms: u64,

    pub auto_commit_threshold: Option<u64>,

    #[envconfig(default = "3000")]
    pub heartbeat_interval_ms: u64,

    #[envconfig(default = "5000")]
    pub max_wait_time_ms: u64,

    #[envconfig(default = "true")]
    pub restart_on_failure: bool,

    #[envconfig(default = "1000")]
    pub restart_backoff_ms: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        if self.restart_on_failure {
            RestartPolicy::Always
        } else {
            RestartPolicy::Never
        }
    }

    pub fn to_consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::new(self.kafka_consumer_group.clone())
            .with_heartbeat_interval(self.heartbeat_interval())
            .with_max_wait_time(self.max_wait_time())
            .with_restart_backoff(self.restart_backoff())
    }

    pub fn commit_policy(&self) -> Result<CommitPolicy> {
        if !self.auto_commit {
            return Ok(CommitPolicy::Manual);
        }
        let interval = (self.auto_commit_interval_ms > 0)
            .then(|| Duration::from_millis(self.auto_commit_interval_ms));

        let policy = match (interval, self.auto_commit_threshold) {
            (Some(interval), Some(threshold)) => CommitPolicy::IntervalAndThreshold {
                interval,
                threshold,
            },
            (Some(interval), None) => CommitPolicy::Interval(interval),
            (None, Some(threshold)) => CommitPolicy::Threshold(threshold),
            (None, None) => {
                return Err(ConsumerError::Config(
                    "AUTO_COMMIT needs an interval or a threshold".to_string(),
                ))
            }
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn subscription(&self) -> Result<Subscription> {
        let selectors = self
            .kafka_consumer_topics
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(TopicSelector::parse)
            .collect::<Result<Vec<_>>>()?;

        Ok(Subscription::new()
            .topics(selectors)
            .from_beginning(self.kafka_consumer_from_beginning))
    }

    /// Run config for the given handler mode with the env commit and restart settings
    pub fn to_run_config(&self, handler: HandlerMode) -> Result<RunConfig> {
        Ok(RunConfig::new(handler)
            .with_commit_policy(self.commit_policy()?)
            .with_concurrency(self.partitions_consumed_concurrently)
            .with_restart_policy(self.restart_policy()))
    }
}

/// Group-level settings that outlive a single run
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    /// How often the run loop heartbeats; long handlers also heartbeat between messages
    pub heartbeat_interval: Duration,
    /// Upper bound a lane sleeps when none of its partitions returned data
    pub max_wait_time: Duration,
    /// Wait before rejoining after a crash
    pub restart_backoff: Duration,
    /// Wait before retrying a join the coordinator answered with "rebalancing"
    pub rebalance_backoff: Duration,
}

impl ConsumerConfig {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            heartbeat_interval: Duration::from_secs(3),
            max_wait_time: Duration::from_secs(5),
            restart_backoff: Duration::from_secs(1),
            rebalance_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_rebalance_backoff(mut self, backoff: Duration) -> Self {
        self.rebalance_backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(ConsumerError::Config("group_id is required".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConsumerError::Config(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.max_wait_time.is_zero() {
            return Err(ConsumerError::Config(
                "max wait time must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

type RestartPredicate = Arc<dyn Fn(&ConsumerError) -> bool + Send + Sync>;

/// Decides whether a crash leads to a rejoin or stops the consumer
#[derive(Clone, Default)]
pub enum RestartPolicy {
    Never,
    #[default]
    Always,
    /// Restart only on errors the broker client may recover from
    OnRetriable,
    Custom(RestartPredicate),
}

impl RestartPolicy {
    pub fn custom<F>(decide: F) -> Self
    where
        F: Fn(&ConsumerError) -> bool + Send + Sync + 'static,
    {
        RestartPolicy::Custom(Arc::new(decide))
    }

    pub fn should_restart(&self, error: &ConsumerError) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnRetriable => error.is_retriable(),
            RestartPolicy::Custom(decide) => decide(error),
        }
    }
}

impl fmt::Debug for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "Never"),
            RestartPolicy::Always => write!(f, "Always"),
            RestartPolicy::OnRetriable => write!(f, "OnRetriable"),
            RestartPolicy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Settings fixed for the lifetime of one `run`
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub commit_policy: CommitPolicy,
    pub concurrency: usize,
    pub handler: HandlerMode,
    pub restart_policy: RestartPolicy,
}

impl RunConfig {
    pub fn new(handler: HandlerMode) -> Self {
        Self {
            commit_policy: CommitPolicy::default(),
            concurrency: 1,
            handler,
            restart_policy: RestartPolicy::default(),
        }
    }

    pub fn per_message(handler: impl MessageHandler + 'static) -> Self {
        Self::new(HandlerMode::PerMessage(Arc::new(handler)))
    }

    pub fn per_batch(handler: impl BatchHandler + 'static, auto_resolve: bool) -> Self {
        Self::new(HandlerMode::PerBatch {
            handler: Arc::new(handler),
            auto_resolve,
        })
    }

    pub fn with_commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.commit_policy = policy;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ConsumerError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        self.commit_policy.validate()
    }
}
