use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::broker::BrokerClient;
use crate::error::BrokerError;
use crate::metrics_consts::HEARTBEAT_ERRORS;

/// Group heartbeat shared by the run loop and the lanes, so a long batch
/// keeps the session alive without doubling the heartbeat rate.
pub struct Heartbeat {
    group_id: String,
    interval: Duration,
    broker: Arc<dyn BrokerClient>,
    started: Instant,
    last_beat_ms: AtomicU64,
}

impl Heartbeat {
    pub fn new(group_id: impl Into<String>, interval: Duration, broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            group_id: group_id.into(),
            interval,
            broker,
            started: Instant::now(),
            last_beat_ms: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn beat(&self) -> Result<(), BrokerError> {
        match self.broker.heartbeat(&self.group_id).await {
            Ok(()) => {
                let now = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
                self.last_beat_ms.store(now, Ordering::SeqCst);
                Ok(())
            }
            Err(BrokerError::RebalanceInProgress) => {
                debug!(group_id = %self.group_id, "Heartbeat reported rebalance");
                Err(BrokerError::RebalanceInProgress)
            }
            Err(e) => {
                metrics::counter!(HEARTBEAT_ERRORS).increment(1);
                warn!(group_id = %self.group_id, error = ?e, "Heartbeat failed");
                Err(e)
            }
        }
    }

    pub fn is_due(&self) -> bool {
        let last = Duration::from_millis(self.last_beat_ms.load(Ordering::SeqCst));
        self.started.elapsed().saturating_sub(last) >= self.interval
    }

    /// Heartbeat only if the interval elapsed. Returns whether one was sent.
    pub async fn beat_if_due(&self) -> Result<bool, BrokerError> {
        if !self.is_due() {
            return Ok(false);
        }
        self.beat().await.map(|()| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestBroker;

    #[tokio::test]
    async fn test_beat_if_due_respects_interval() {
        let broker = Arc::new(TestBroker::new());
        let heartbeat = Heartbeat::new("test-group", Duration::from_millis(50), broker.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(heartbeat.beat_if_due().await.unwrap());
        assert!(!heartbeat.beat_if_due().await.unwrap());
        assert_eq!(broker.heartbeat_count(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(heartbeat.beat_if_due().await.unwrap());
        assert_eq!(broker.heartbeat_count(), 2);
    }

    #[tokio::test]
    async fn test_rebalance_is_reported() {
        let broker = Arc::new(TestBroker::new());
        broker.trigger_rebalance();
        let heartbeat = Heartbeat::new("test-group", Duration::from_millis(50), broker.clone());

        assert_eq!(heartbeat.beat().await, Err(BrokerError::RebalanceInProgress));
    }
}
