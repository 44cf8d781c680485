use std::sync::Arc;

use thiserror::Error;

use crate::lifecycle::ConsumerState;
use crate::types::{Offset, TopicPartition};

/// Failures reported by a [`BrokerClient`](crate::broker::BrokerClient).
///
/// The broker client owns its own retries; a `Connectivity` error means those
/// retries are exhausted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Connectivity(String),

    #[error("group is rebalancing")]
    RebalanceInProgress,

    #[error("group session expired")]
    SessionExpired,

    #[error("unknown topic or partition {0}")]
    UnknownTopicOrPartition(TopicPartition),

    #[error("broker rejected request: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("connectivity failure: {0}")]
    Connectivity(#[source] BrokerError),

    #[error("handler failed for {topic_partition} at offset {offset:?}: {source:#}")]
    Handler {
        topic_partition: TopicPartition,
        offset: Option<Offset>,
        #[source]
        source: anyhow::Error,
    },

    #[error("stale operation on {0}: partition was revoked or sought elsewhere")]
    StaleOperation(TopicPartition),

    #[error("offset commit failed: {0}")]
    CommitFailure(#[source] BrokerError),

    #[error("group session expired")]
    SessionExpired,

    #[error("partition {0} is not assigned to this consumer")]
    NotAssigned(TopicPartition),

    #[error("cannot {operation} while consumer is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConsumerState,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Crash error that a crash listener still holds a reference to
    #[error("consumer crashed: {0}")]
    Crashed(Arc<ConsumerError>),
}

impl ConsumerError {
    /// Whether this error must be surfaced to crash listeners
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            ConsumerError::Connectivity(_)
                | ConsumerError::Handler { .. }
                | ConsumerError::SessionExpired
        )
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, ConsumerError::Connectivity(_))
    }

    pub(crate) fn handler(
        topic_partition: &TopicPartition,
        offset: Option<Offset>,
        source: anyhow::Error,
    ) -> Self {
        ConsumerError::Handler {
            topic_partition: topic_partition.clone(),
            offset,
            source,
        }
    }
}

impl From<BrokerError> for ConsumerError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::SessionExpired => ConsumerError::SessionExpired,
            BrokerError::UnknownTopicOrPartition(tp) => ConsumerError::NotAssigned(tp),
            other => ConsumerError::Connectivity(other),
        }
    }
}

pub type Result<T, E = ConsumerError> = std::result::Result<T, E>;
