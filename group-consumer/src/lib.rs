//! Consumer-group runtime for a partitioned log broker.
//!
//! The runtime joins a consumer group through a [`BrokerClient`], delivers
//! each assigned partition's messages in order to a user handler while
//! running up to `concurrency` partitions at once, tracks resolved offsets and
//! commits them under a manual, interval or threshold policy, and recovers
//! from rebalances, seeks and crashes.
//!
//! ## Error logging (anyhow)
//!
//! Handler failures keep their `anyhow` chain as the error source. Log them
//! as `error = ?e` (Debug) or `{e:#}` so the root cause stays visible; `%e`
//! only shows the top-level message.

pub mod broker;
pub mod commit_scheduler;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod lifecycle;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod partition_dispatcher;
pub mod pause_controller;
pub mod subscription;
pub mod test_utils;
pub mod types;

// Re-export commonly used types for convenience
pub use broker::{BrokerClient, GroupJoin, PartitionAssignment};
pub use commit_scheduler::{CommitPolicy, CommitTrigger};
pub use config::{Config, ConsumerConfig, RestartPolicy, RunConfig};
pub use error::{BrokerError, ConsumerError, Result};
pub use events::{CrashEvent, GroupJoinEvent, ListenerHandle};
pub use lifecycle::{Consumer, ConsumerState};
pub use partition_dispatcher::{BatchControl, BatchHandler, HandlerMode, MessageHandler};
pub use pause_controller::ResumeHandle;
pub use subscription::{Subscription, TopicSelector};
pub use types::{Batch, Message, Offset, TopicPartition};
