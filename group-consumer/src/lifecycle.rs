//! Group Lifecycle Manager - the consumer's connect/subscribe/run/disconnect
//! state machine.
//!
//! `run` owns the assignment: it joins the group, hands dispatchers to the
//! lanes, heartbeats and drives interval commits, and reacts to rebalances
//! and crashes. Every other operation on [`Consumer`] takes `&self` and may be
//! called from any task while `run` is in progress.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, GroupJoin};
use crate::commit_scheduler::{CommitScheduler, CommitTrigger};
use crate::concurrency::{LaneExit, LanePool};
use crate::config::{ConsumerConfig, RunConfig};
use crate::error::{BrokerError, ConsumerError, Result};
use crate::events::{ConsumerEvents, CrashEvent, GroupJoinEvent, ListenerHandle};
use crate::heartbeat::Heartbeat;
use crate::metrics_consts::{ASSIGNED_PARTITIONS, CRASHES, REBALANCES};
use crate::offset_tracker::OffsetTracker;
use crate::partition_dispatcher::{DispatchContext, PartitionDispatcher};
use crate::pause_controller::{PauseController, ResumeHandle};
use crate::subscription::{ResolvedSubscription, Subscription, TopicSelector};
use crate::types::{Offset, TopicPartition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Connected,
    Subscribed,
    Running,
    Crashed,
    Stopped,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Idle => "idle",
            ConsumerState::Connected => "connected",
            ConsumerState::Subscribed => "subscribed",
            ConsumerState::Running => "running",
            ConsumerState::Crashed => "crashed",
            ConsumerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one assignment generation ended
enum RunExit {
    Shutdown,
    Rebalance,
    Crash(ConsumerError),
}

type Dispatchers = HashMap<TopicPartition, PartitionDispatcher>;

pub struct Consumer {
    config: ConsumerConfig,
    broker: Arc<dyn BrokerClient>,
    tracker: Arc<OffsetTracker>,
    controller: Arc<PauseController>,
    events: ConsumerEvents,
    state: watch::Sender<ConsumerState>,
    connected: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
    resolved: Mutex<Option<ResolvedSubscription>>,
    /// Present while `run` is in progress
    scheduler: Mutex<Option<Arc<CommitScheduler>>>,
    shutdown: CancellationToken,
    run_guard: Mutex<()>,
}

impl Consumer {
    pub fn new(config: ConsumerConfig, broker: Arc<dyn BrokerClient>) -> Result<Self> {
        config.validate()?;
        let tracker = Arc::new(OffsetTracker::new());
        let (state, _) = watch::channel(ConsumerState::Idle);

        Ok(Self {
            config,
            broker,
            controller: Arc::new(PauseController::new(tracker.clone())),
            tracker,
            events: ConsumerEvents::new(),
            state,
            connected: AtomicBool::new(false),
            subscription: Mutex::new(None),
            resolved: Mutex::new(None),
            scheduler: Mutex::new(None),
            shutdown: CancellationToken::new(),
            run_guard: Mutex::new(()),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn state_changes(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(
                group_id = %self.config.group_id,
                from = previous.as_str(),
                to = state.as_str(),
                "Consumer state changed"
            );
        }
    }

    fn expect_state(&self, operation: &'static str, allowed: &[ConsumerState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(ConsumerError::InvalidState { operation, state })
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.expect_state("connect", &[ConsumerState::Idle])?;
        self.broker.connect().await?;
        self.connected.store(true, Ordering::SeqCst);
        self.set_state(ConsumerState::Connected);
        Ok(())
    }

    /// Set the topics to consume. Patterns are matched against the topics
    /// that exist now; subscribing again re-evaluates them.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        self.expect_state(
            "subscribe",
            &[ConsumerState::Connected, ConsumerState::Subscribed],
        )?;

        let resolved = self.resolve_subscription(&subscription).await?;
        *self.subscription.lock().await = Some(subscription);
        *self.resolved.lock().await = Some(resolved);
        self.set_state(ConsumerState::Subscribed);
        Ok(())
    }

    async fn resolve_subscription(&self, subscription: &Subscription) -> Result<ResolvedSubscription> {
        let has_patterns = subscription
            .selectors()
            .iter()
            .any(|s| matches!(s, TopicSelector::Pattern(_)));
        let available = if has_patterns {
            self.broker.list_topics().await?
        } else {
            Vec::new()
        };

        let resolved = subscription.resolve(&available)?;
        info!(
            group_id = %self.config.group_id,
            topics = ?resolved.topics(),
            from_beginning = resolved.from_beginning(),
            "Resolved subscription"
        );
        Ok(resolved)
    }

    /// Consume until `disconnect` is called (returns `Ok`) or a crash the
    /// restart policy does not recover from (returns that error).
    pub async fn run(&self, run: RunConfig) -> Result<()> {
        run.validate()?;
        let Ok(_running) = self.run_guard.try_lock() else {
            return Err(ConsumerError::InvalidState {
                operation: "run",
                state: self.state(),
            });
        };
        self.expect_state("run", &[ConsumerState::Subscribed])?;

        let scheduler = Arc::new(CommitScheduler::new(
            self.config.group_id.clone(),
            run.commit_policy,
            self.tracker.clone(),
            self.broker.clone(),
        ));
        *self.scheduler.lock().await = Some(scheduler.clone());

        let ctx = Arc::new(DispatchContext {
            group_id: self.config.group_id.clone(),
            broker: self.broker.clone(),
            tracker: self.tracker.clone(),
            scheduler,
            controller: self.controller.clone(),
            heartbeat: Arc::new(Heartbeat::new(
                self.config.group_id.clone(),
                self.config.heartbeat_interval,
                self.broker.clone(),
            )),
            handler: run.handler.clone(),
        });

        info!(
            group_id = %self.config.group_id,
            concurrency = run.concurrency,
            commit_policy = ?run.commit_policy,
            handler = ?run.handler,
            "Starting consumer run"
        );
        self.set_state(ConsumerState::Running);

        let mut dispatchers = Dispatchers::new();
        let result = self.run_loop(&ctx, &run, &mut dispatchers).await;

        *self.scheduler.lock().await = None;
        self.reset_assignment(&mut dispatchers);
        result
    }

    async fn run_loop(
        &self,
        ctx: &Arc<DispatchContext>,
        run: &RunConfig,
        dispatchers: &mut Dispatchers,
    ) -> Result<()> {
        let mut pending_crash: Option<ConsumerError> = None;

        loop {
            let exit = match pending_crash.take() {
                Some(error) => RunExit::Crash(error),
                None => match self.rejoin(dispatchers).await {
                    Ok(()) => self.consume(ctx, run, dispatchers).await,
                    Err(e) => RunExit::Crash(e),
                },
            };

            match exit {
                RunExit::Shutdown => {
                    ctx.scheduler.flush_before(CommitTrigger::Shutdown).await;
                    info!(group_id = %self.config.group_id, "Consumer run stopped");
                    return Ok(());
                }
                RunExit::Rebalance => {
                    info!(group_id = %self.config.group_id, "Rebalance in progress, rejoining group");
                    ctx.scheduler.flush_before(CommitTrigger::Rebalance).await;
                }
                RunExit::Crash(error) => {
                    self.set_state(ConsumerState::Crashed);
                    ctx.scheduler.flush_before(CommitTrigger::Crash).await;
                    self.reset_assignment(dispatchers);

                    if !error.is_crash() {
                        error!(
                            group_id = %self.config.group_id,
                            error = ?error,
                            "Consumer run failed"
                        );
                        self.set_state(ConsumerState::Stopped);
                        return Err(error);
                    }

                    let restart = run.restart_policy.should_restart(&error);
                    metrics::counter!(CRASHES, "restart" => restart.to_string()).increment(1);
                    error!(
                        group_id = %self.config.group_id,
                        error = ?error,
                        restart = restart,
                        "Consumer crashed"
                    );

                    let error = Arc::new(error);
                    self.events.emit_crash(&CrashEvent {
                        error: error.clone(),
                        group_id: self.config.group_id.clone(),
                        restart,
                    });

                    if !restart {
                        self.set_state(ConsumerState::Stopped);
                        // a listener may still hold the shared error
                        return Err(Arc::try_unwrap(error).unwrap_or_else(ConsumerError::Crashed));
                    }

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.restart_backoff) => {}
                    }
                    if let Err(e) = self.restart_session().await {
                        pending_crash = Some(e);
                    }
                }
            }
        }
    }

    /// Reconnect and re-resolve the subscription after a crash
    async fn restart_session(&self) -> Result<()> {
        info!(group_id = %self.config.group_id, "Restarting consumer");

        self.broker.connect().await?;
        self.connected.store(true, Ordering::SeqCst);
        self.set_state(ConsumerState::Connected);

        let subscription = self.subscription.lock().await.clone();
        if let Some(subscription) = subscription {
            let resolved = self.resolve_subscription(&subscription).await?;
            *self.resolved.lock().await = Some(resolved);
        }
        self.set_state(ConsumerState::Subscribed);
        self.set_state(ConsumerState::Running);
        Ok(())
    }

    /// Join the group and reconcile dispatchers with the new assignment.
    /// Commits are refused until the assignment is applied.
    async fn rejoin(&self, dispatchers: &mut Dispatchers) -> Result<()> {
        self.tracker.set_rebalancing(true);
        let result = self.join_and_assign(dispatchers).await;
        self.tracker.set_rebalancing(false);
        result
    }

    async fn join_and_assign(&self, dispatchers: &mut Dispatchers) -> Result<()> {
        let Some(subscription) = self.resolved.lock().await.clone() else {
            return Err(ConsumerError::InvalidState {
                operation: "join group",
                state: self.state(),
            });
        };

        let started = Instant::now();
        let join = loop {
            match self
                .broker
                .join_group(&self.config.group_id, subscription.topics())
                .await
            {
                Ok(join) => break join,
                Err(BrokerError::RebalanceInProgress) => {
                    debug!(group_id = %self.config.group_id, "Group still rebalancing, retrying join");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.rebalance_backoff) => {}
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.apply_assignment(&join, subscription.from_beginning(), dispatchers)
            .await?;

        let event = GroupJoinEvent {
            duration: started.elapsed(),
            group_id: self.config.group_id.clone(),
            group_protocol: join.group_protocol.clone(),
            is_leader: join.is_leader(),
            leader_id: join.leader_id.clone(),
            member_assignment: join.member_assignment(),
            member_id: join.member_id.clone(),
        };
        metrics::counter!(REBALANCES).increment(1);
        info!(
            group_id = %self.config.group_id,
            generation_id = join.generation_id,
            member_id = %join.member_id,
            is_leader = event.is_leader,
            assignment = ?event.member_assignment,
            duration_ms = event.duration.as_millis() as u64,
            "Joined consumer group"
        );
        self.events.emit_group_join(&event);
        Ok(())
    }

    async fn apply_assignment(
        &self,
        join: &GroupJoin,
        from_beginning: bool,
        dispatchers: &mut Dispatchers,
    ) -> Result<()> {
        let assigned: HashSet<&TopicPartition> =
            join.assignment.iter().map(|a| a.partition()).collect();

        let revoked: BTreeSet<TopicPartition> = self
            .controller
            .assigned_partitions()
            .into_iter()
            .chain(dispatchers.keys().cloned())
            .filter(|tp| !assigned.contains(tp))
            .collect();
        for partition in &revoked {
            self.tracker.clear_partition(partition);
            self.controller.revoke(partition);
            dispatchers.remove(partition);
        }
        if !revoked.is_empty() {
            info!(
                group_id = %self.config.group_id,
                revoked = ?revoked,
                "Revoked partitions"
            );
        }

        for assignment in &join.assignment {
            let partition = assignment.partition();
            if dispatchers.contains_key(partition) {
                continue;
            }

            let control = self.controller.assign(partition);
            let position = match assignment.committed() {
                Some(committed) => committed,
                None => self.broker.list_offset(partition, from_beginning).await?,
            };
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                position = %position,
                "Assigned partition"
            );
            dispatchers.insert(
                partition.clone(),
                PartitionDispatcher::new(partition.clone(), position, control),
            );
        }

        metrics::gauge!(ASSIGNED_PARTITIONS).set(dispatchers.len() as f64);
        Ok(())
    }

    /// Run lanes over the current assignment until shutdown, a rebalance or a crash
    async fn consume(
        &self,
        ctx: &Arc<DispatchContext>,
        run: &RunConfig,
        dispatchers: &mut Dispatchers,
    ) -> RunExit {
        let mut pool = LanePool::spawn(
            dispatchers.drain().map(|(_, d)| d).collect(),
            run.concurrency,
            ctx.clone(),
            self.shutdown.child_token(),
            self.config.max_wait_time,
        );

        let interval = ctx.heartbeat.interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            let commit_due_in = ctx.scheduler.time_until_interval();
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break RunExit::Shutdown,

                lane_exit = pool.next_exit() => match lane_exit {
                    LaneExit::Cancelled => {}
                    LaneExit::Rebalance => break RunExit::Rebalance,
                    LaneExit::Crashed(e) => break RunExit::Crash(e),
                },

                _ = heartbeat.tick() => match ctx.heartbeat.beat().await {
                    Ok(()) => {}
                    Err(BrokerError::RebalanceInProgress) => break RunExit::Rebalance,
                    Err(e) => break RunExit::Crash(e.into()),
                },

                _ = tokio::time::sleep(commit_due_in.unwrap_or_default()), if commit_due_in.is_some() => {
                    match ctx.scheduler.commit_if_necessary().await {
                        Ok(_) => {}
                        Err(ConsumerError::CommitFailure(BrokerError::RebalanceInProgress)) => {
                            break RunExit::Rebalance
                        }
                        Err(e) => warn!(
                            group_id = %self.config.group_id,
                            error = ?e,
                            "Interval commit failed"
                        ),
                    }
                }
            }
        };

        let (returned, lane_crash) = pool.stop().await;
        for dispatcher in returned {
            if !dispatcher.is_revoked() {
                dispatchers.insert(dispatcher.partition().clone(), dispatcher);
            }
        }

        match (exit, lane_crash) {
            (RunExit::Shutdown, Some(e)) => {
                warn!(error = ?e, "Lane failed while shutting down");
                RunExit::Shutdown
            }
            (RunExit::Crash(e), other) => {
                if let Some(other) = other {
                    debug!(error = ?other, "Additional lane failure during crash");
                }
                RunExit::Crash(e)
            }
            (_, Some(e)) => RunExit::Crash(e),
            (exit, None) => exit,
        }
    }

    /// Forget the assignment: tracker entries, controls and dispatchers
    fn reset_assignment(&self, dispatchers: &mut Dispatchers) {
        self.tracker.clear_all();
        self.controller.revoke_all();
        dispatchers.clear();
        metrics::gauge!(ASSIGNED_PARTITIONS).set(0.0);
    }

    /// Stop consuming and leave the cluster. Waits for in-flight handlers and
    /// the final flush of the run loop. Valid from any state; the consumer
    /// cannot be reused afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.shutdown.is_cancelled() {
            info!(group_id = %self.config.group_id, "Disconnecting consumer");
        }
        self.shutdown.cancel();
        self.controller.wake_all();

        let _stopped = self.run_guard.lock().await;
        let result = if self.connected.swap(false, Ordering::SeqCst) {
            self.broker.disconnect().await.map_err(ConsumerError::from)
        } else {
            Ok(())
        };
        self.set_state(ConsumerState::Stopped);
        result
    }

    pub fn pause(&self, partition: &TopicPartition) -> ResumeHandle {
        self.controller.pause(partition)
    }

    pub fn resume(&self, partition: &TopicPartition) -> bool {
        self.controller.resume(partition)
    }

    pub fn paused(&self) -> Vec<TopicPartition> {
        self.controller.paused()
    }

    pub fn seek(&self, partition: &TopicPartition, offset: Offset) -> Result<()> {
        self.controller.seek(partition, offset)
    }

    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        self.controller.assigned_partitions()
    }

    pub fn uncommitted_offsets(&self) -> HashMap<TopicPartition, Offset> {
        self.tracker.snapshot_uncommitted()
    }

    /// Commit resolved offsets (`None`) or exactly the given positions
    pub async fn commit_offsets(
        &self,
        offsets: Option<HashMap<TopicPartition, Offset>>,
    ) -> Result<usize> {
        let scheduler = self.scheduler.lock().await.clone();
        match scheduler {
            Some(scheduler) => scheduler.commit(offsets).await,
            None => Err(ConsumerError::InvalidState {
                operation: "commit offsets",
                state: self.state(),
            }),
        }
    }

    pub fn on_crash<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&CrashEvent) + Send + Sync + 'static,
    {
        self.events.on_crash(callback)
    }

    pub fn on_group_join<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&GroupJoinEvent) + Send + Sync + 'static,
    {
        self.events.on_group_join(callback)
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("group_id", &self.config.group_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
