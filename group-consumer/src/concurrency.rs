//! Concurrency Coordinator - runs partition dispatchers on a bounded set of lanes
//!
//! Partitions are sorted and dealt round-robin onto `min(concurrency,
//! assigned)` lanes. A lane is a tokio task that owns its dispatchers and
//! steps them one after another, so per-partition order holds for any lane
//! count while different lanes progress concurrently.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::ConsumerError;
use crate::metrics_consts::ACTIVE_LANES;
use crate::partition_dispatcher::{DispatchContext, PartitionDispatcher, StepOutcome};

/// Why a lane stopped
#[derive(Debug)]
pub enum LaneExit {
    Cancelled,
    Rebalance,
    Crashed(ConsumerError),
}

/// Deal dispatchers onto at most `concurrency` lanes, in partition order
pub fn plan_lanes(
    mut dispatchers: Vec<PartitionDispatcher>,
    concurrency: usize,
) -> Vec<Vec<PartitionDispatcher>> {
    dispatchers.sort_by(|a, b| a.partition().cmp(b.partition()));

    let lane_count = concurrency.max(1).min(dispatchers.len());
    let mut lanes: Vec<Vec<PartitionDispatcher>> = (0..lane_count).map(|_| Vec::new()).collect();
    for (i, dispatcher) in dispatchers.into_iter().enumerate() {
        lanes[i % lane_count].push(dispatcher);
    }
    lanes
}

async fn run_lane(
    lane_id: usize,
    mut dispatchers: Vec<PartitionDispatcher>,
    ctx: Arc<DispatchContext>,
    cancel: CancellationToken,
    max_wait_time: Duration,
) -> (LaneExit, Vec<PartitionDispatcher>) {
    debug!(
        lane = lane_id,
        partitions = dispatchers.len(),
        "Lane started"
    );

    loop {
        if cancel.is_cancelled() {
            return (LaneExit::Cancelled, dispatchers);
        }

        // registered before stepping so a resume or seek issued mid-step still wakes us
        let woken = ctx.controller.notified();
        tokio::pin!(woken);

        let mut progressed = false;
        for dispatcher in dispatchers.iter_mut() {
            if cancel.is_cancelled() {
                break;
            }
            match dispatcher.step(&ctx, &cancel).await {
                Ok(StepOutcome::Dispatched) => progressed = true,
                Ok(StepOutcome::Idle | StepOutcome::Paused | StepOutcome::Revoked) => {}
                Ok(StepOutcome::Rebalance) => return (LaneExit::Rebalance, dispatchers),
                Err(e) => return (LaneExit::Crashed(e), dispatchers),
            }
        }
        dispatchers.retain(|d| !d.is_revoked());

        if !progressed {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = &mut woken => {}
                _ = tokio::time::sleep(max_wait_time) => {}
            }
        }
    }
}

/// Lanes of one assignment generation
pub struct LanePool {
    tasks: JoinSet<(LaneExit, Vec<PartitionDispatcher>)>,
    cancel: CancellationToken,
    returned: Vec<PartitionDispatcher>,
}

impl LanePool {
    /// Spawn lanes for the given dispatchers. `cancel` stops every lane once
    /// its current handler invocation finished.
    pub fn spawn(
        dispatchers: Vec<PartitionDispatcher>,
        concurrency: usize,
        ctx: Arc<DispatchContext>,
        cancel: CancellationToken,
        max_wait_time: Duration,
    ) -> Self {
        let lanes = plan_lanes(dispatchers, concurrency);
        info!(
            lanes = lanes.len(),
            concurrency = concurrency,
            "Starting dispatch lanes"
        );
        metrics::gauge!(ACTIVE_LANES).set(lanes.len() as f64);

        let mut tasks = JoinSet::new();
        for (lane_id, lane) in lanes.into_iter().enumerate() {
            tasks.spawn(run_lane(
                lane_id,
                lane,
                ctx.clone(),
                cancel.clone(),
                max_wait_time,
            ));
        }

        Self {
            tasks,
            cancel,
            returned: Vec::new(),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for the next lane to stop on its own. Never resolves while no
    /// lane is running.
    pub async fn next_exit(&mut self) -> LaneExit {
        loop {
            if self.tasks.is_empty() {
                return pending().await;
            }
            match self.tasks.join_next().await {
                Some(Ok((exit, dispatchers))) => {
                    self.returned.extend(dispatchers);
                    return exit;
                }
                Some(Err(e)) => {
                    // the lane's partitions are picked up again by the next rejoin
                    error!(error = ?e, "Dispatch lane terminated abnormally");
                    return LaneExit::Rebalance;
                }
                None => {}
            }
        }
    }

    /// Cancel all lanes, wait for in-flight handlers, and hand back every
    /// dispatcher together with the first crash seen while stopping.
    pub async fn stop(mut self) -> (Vec<PartitionDispatcher>, Option<ConsumerError>) {
        self.cancel.cancel();

        let mut crash = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((exit, dispatchers)) => {
                    self.returned.extend(dispatchers);
                    if let LaneExit::Crashed(e) = exit {
                        if crash.is_none() {
                            crash = Some(e);
                        } else {
                            debug!(error = ?e, "Additional lane crash while stopping");
                        }
                    }
                }
                Err(e) => error!(error = ?e, "Dispatch lane terminated abnormally"),
            }
        }
        metrics::gauge!(ACTIVE_LANES).set(0.0);

        (self.returned, crash)
    }
}
