//! Partition Dispatcher - fetches and delivers batches for a single partition
//!
//! A dispatcher is owned by exactly one lane, which steps it serially, so two
//! messages of the same partition are never handled at the same time.
//! Everything other lanes or callers may change concurrently (pause, seek,
//! revocation) is read from the shared `PartitionControl` between handler
//! invocations.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::broker::BrokerClient;
use crate::commit_scheduler::CommitScheduler;
use crate::error::{BrokerError, ConsumerError, Result};
use crate::heartbeat::Heartbeat;
use crate::metrics_consts::{
    BATCHES_DISPATCHED, HANDLER_DURATION_MS, HANDLER_ERRORS, MESSAGES_HANDLED,
    STALE_BATCHES_DISCARDED, STALE_RESOLUTIONS_REJECTED,
};
use crate::offset_tracker::OffsetTracker;
use crate::pause_controller::{PartitionControl, PauseController, ResumeHandle};
use crate::types::{Batch, Message, Offset, TopicPartition};

/// Handler invoked once per message, in offset order within a partition
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, partition: &TopicPartition, message: &Message) -> anyhow::Result<()>;
}

/// Handler invoked once per fetched batch
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: &Batch, control: &BatchControl) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub enum HandlerMode {
    PerMessage(Arc<dyn MessageHandler>),
    PerBatch {
        handler: Arc<dyn BatchHandler>,
        /// Resolve the batch's last offset when the handler returns Ok
        auto_resolve: bool,
    },
}

impl fmt::Debug for HandlerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerMode::PerMessage(_) => write!(f, "PerMessage"),
            HandlerMode::PerBatch { auto_resolve, .. } => f
                .debug_struct("PerBatch")
                .field("auto_resolve", auto_resolve)
                .finish_non_exhaustive(),
        }
    }
}

/// Everything a dispatcher needs that is shared across partitions and lanes
pub struct DispatchContext {
    pub group_id: String,
    pub broker: Arc<dyn BrokerClient>,
    pub tracker: Arc<OffsetTracker>,
    pub scheduler: Arc<CommitScheduler>,
    pub controller: Arc<PauseController>,
    pub heartbeat: Arc<Heartbeat>,
    pub handler: HandlerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Active,
    Paused,
    /// A seek invalidated the in-flight batch; back to `Active` on the next step
    Stale,
    Revoked,
}

/// Result of one dispatcher step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A batch (or part of one) went through the handler
    Dispatched,
    /// The broker had nothing new
    Idle,
    Paused,
    Revoked,
    /// The group is rebalancing; the lane must stop
    Rebalance,
}

pub struct PartitionDispatcher {
    partition: TopicPartition,
    position: Offset,
    control: Arc<PartitionControl>,
    state: DispatcherState,
}

impl PartitionDispatcher {
    pub fn new(partition: TopicPartition, position: Offset, control: Arc<PartitionControl>) -> Self {
        Self {
            partition,
            position,
            control,
            state: DispatcherState::Active,
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Offset the next fetch starts from
    pub fn position(&self) -> Offset {
        self.position
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn is_revoked(&self) -> bool {
        self.state == DispatcherState::Revoked || self.control.is_revoked()
    }

    /// Run one fetch/dispatch cycle.
    ///
    /// `Err` is a crash: handler failure, session expiry or exhausted
    /// connectivity. Everything else is reported through `StepOutcome`.
    pub async fn step(
        &mut self,
        ctx: &DispatchContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        if self.control.is_revoked() {
            self.state = DispatcherState::Revoked;
            return Ok(StepOutcome::Revoked);
        }
        if ctx.controller.is_paused(&self.partition) {
            self.state = DispatcherState::Paused;
            return Ok(StepOutcome::Paused);
        }

        // read the epoch before taking the seek so a seek racing this step
        // makes the fetched batch stale instead of getting lost
        let epoch = self.control.epoch();
        if let Some(target) = self.control.take_seek() {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition_number(),
                from = %self.position,
                to = %target,
                "Applying seek"
            );
            self.position = target;
        }
        // tracker entries are replaced on seek; resolutions are only accepted
        // against the entry this step started from
        let generation = ctx.tracker.generation(&self.partition);
        self.state = DispatcherState::Active;

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StepOutcome::Idle),
            fetched = ctx.broker.fetch_batch(&self.partition, self.position) => fetched,
        };
        let batch = match fetched {
            Ok(batch) => batch,
            Err(e) => return self.fetch_failed(e),
        };

        if self.control.is_stale(epoch) {
            self.discard_stale(&batch, "fetch");
            return Ok(StepOutcome::Dispatched);
        }
        if batch.is_empty() {
            // stale leftovers only: the next fetch moves on without waiting
            return Ok(if batch.is_empty_including_filtered() {
                StepOutcome::Idle
            } else {
                StepOutcome::Dispatched
            });
        }

        metrics::counter!(BATCHES_DISPATCHED, "topic" => self.partition.topic().to_string())
            .increment(1);
        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            first_offset = ?batch.first_offset(),
            last_offset = ?batch.last_offset(),
            offset_lag = batch.offset_lag(),
            "Dispatching batch"
        );

        let outcome = match &ctx.handler {
            HandlerMode::PerMessage(handler) => {
                self.dispatch_messages(ctx, handler.as_ref(), &batch, epoch, generation, cancel)
                    .await?
            }
            HandlerMode::PerBatch {
                handler,
                auto_resolve,
            } => {
                let resolving = Resolving { epoch, generation };
                self.dispatch_batch(ctx, handler.as_ref(), &batch, *auto_resolve, resolving, cancel)
                    .await?
            }
        };

        if self.control.is_stale(epoch) {
            self.discard_stale(&batch, "handler");
        } else if let Some(resolved) = ctx.tracker.resolved_position(&self.partition) {
            // unresolved messages are fetched again
            self.position = resolved;
        }

        Ok(outcome)
    }

    async fn dispatch_messages(
        &mut self,
        ctx: &DispatchContext,
        handler: &dyn MessageHandler,
        batch: &Batch,
        epoch: u64,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        for message in batch.messages() {
            if cancel.is_cancelled()
                || self.control.is_stale(epoch)
                || ctx.controller.is_paused(&self.partition)
            {
                break;
            }

            let started = Instant::now();
            let result = AssertUnwindSafe(handler.handle(&self.partition, message))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_error(panic)));
            self.record_duration(started);

            if let Err(e) = result {
                return Err(self.handler_failed(Some(message.offset), e));
            }
            metrics::counter!(MESSAGES_HANDLED, "topic" => self.partition.topic().to_string())
                .increment(1);

            if self.control.is_stale(epoch)
                || ctx
                    .tracker
                    .resolve_in(&self.partition, message.offset, generation)
                    .is_err()
            {
                metrics::counter!(STALE_RESOLUTIONS_REJECTED).increment(1);
                break;
            }

            match ctx.scheduler.commit_if_necessary().await {
                Ok(_) => {}
                Err(ConsumerError::CommitFailure(BrokerError::RebalanceInProgress)) => {
                    return Ok(StepOutcome::Rebalance)
                }
                Err(e) => warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    error = ?e,
                    "Automatic commit failed"
                ),
            }

            match ctx.heartbeat.beat_if_due().await {
                Ok(_) => {}
                Err(BrokerError::RebalanceInProgress) => return Ok(StepOutcome::Rebalance),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(StepOutcome::Dispatched)
    }

    async fn dispatch_batch(
        &mut self,
        ctx: &DispatchContext,
        handler: &dyn BatchHandler,
        batch: &Batch,
        auto_resolve: bool,
        resolving: Resolving,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        let control = BatchControl {
            partition: self.partition.clone(),
            epoch: resolving.epoch,
            generation: resolving.generation,
            control: self.control.clone(),
            tracker: ctx.tracker.clone(),
            scheduler: ctx.scheduler.clone(),
            controller: ctx.controller.clone(),
            heartbeat: ctx.heartbeat.clone(),
            cancel: cancel.clone(),
            rebalance_requested: AtomicBool::new(false),
            session_expired: AtomicBool::new(false),
        };

        let started = Instant::now();
        let result = AssertUnwindSafe(handler.handle(batch, &control))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic)));
        self.record_duration(started);

        if let Err(e) = result {
            let failed_at = self.first_unresolved(ctx, batch);
            return Err(self.handler_failed(failed_at, e));
        }
        metrics::counter!(MESSAGES_HANDLED, "topic" => self.partition.topic().to_string())
            .increment(batch.len() as u64);

        if control.session_expired.load(Ordering::SeqCst) {
            return Err(ConsumerError::SessionExpired);
        }

        if auto_resolve {
            if let Some(last) = batch.last_offset() {
                if control.resolve_offset(last).is_err() {
                    debug!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition_number(),
                        "Skipped auto-resolve of stale batch"
                    );
                }
            }
        }

        if control.rebalance_requested.load(Ordering::SeqCst) {
            return Ok(StepOutcome::Rebalance);
        }

        match ctx.scheduler.commit_if_necessary().await {
            Ok(_) => Ok(StepOutcome::Dispatched),
            Err(ConsumerError::CommitFailure(BrokerError::RebalanceInProgress)) => {
                Ok(StepOutcome::Rebalance)
            }
            Err(e) => {
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    error = ?e,
                    "Automatic commit failed"
                );
                Ok(StepOutcome::Dispatched)
            }
        }
    }

    fn fetch_failed(&mut self, e: BrokerError) -> Result<StepOutcome> {
        match e {
            BrokerError::RebalanceInProgress | BrokerError::UnknownTopicOrPartition(_) => {
                debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    error = ?e,
                    "Fetch requires a rejoin"
                );
                Ok(StepOutcome::Rebalance)
            }
            BrokerError::SessionExpired => Err(ConsumerError::SessionExpired),
            other => Err(ConsumerError::Connectivity(other)),
        }
    }

    fn discard_stale(&mut self, batch: &Batch, stage: &'static str) {
        self.state = if self.control.is_revoked() {
            DispatcherState::Revoked
        } else {
            DispatcherState::Stale
        };
        metrics::counter!(STALE_BATCHES_DISCARDED, "stage" => stage).increment(1);
        warn!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            first_offset = ?batch.first_offset(),
            last_offset = ?batch.last_offset(),
            stage = stage,
            "Discarding stale batch"
        );
    }

    fn handler_failed(&self, offset: Option<Offset>, e: anyhow::Error) -> ConsumerError {
        metrics::counter!(HANDLER_ERRORS, "topic" => self.partition.topic().to_string())
            .increment(1);
        error!(
            topic = self.partition.topic(),
            partition = self.partition.partition_number(),
            offset = ?offset,
            error = ?e,
            "Handler failed"
        );
        ConsumerError::handler(&self.partition, offset, e)
    }

    /// First message of the batch the handler had not resolved when it failed
    fn first_unresolved(&self, ctx: &DispatchContext, batch: &Batch) -> Option<Offset> {
        let resolved = ctx.tracker.resolved_position(&self.partition);
        batch
            .messages()
            .iter()
            .map(|m| m.offset)
            .find(|offset| resolved.map_or(true, |position| *offset >= position))
    }

    fn record_duration(&self, started: Instant) {
        metrics::histogram!(HANDLER_DURATION_MS, "topic" => self.partition.topic().to_string())
            .record(started.elapsed().as_secs_f64() * 1000.0);
    }
}

impl fmt::Debug for PartitionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionDispatcher")
            .field("partition", &self.partition)
            .field("position", &self.position)
            .field("state", &self.state)
            .finish()
    }
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> anyhow::Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    anyhow::anyhow!("handler panicked: {message}")
}

/// Epoch and tracker generation a batch was fetched under
#[derive(Debug, Clone, Copy)]
struct Resolving {
    epoch: u64,
    generation: u64,
}

/// What a batch handler may do while it holds a batch
pub struct BatchControl {
    partition: TopicPartition,
    epoch: u64,
    generation: u64,
    control: Arc<PartitionControl>,
    tracker: Arc<OffsetTracker>,
    scheduler: Arc<CommitScheduler>,
    controller: Arc<PauseController>,
    heartbeat: Arc<Heartbeat>,
    cancel: CancellationToken,
    rebalance_requested: AtomicBool,
    session_expired: AtomicBool,
}

impl BatchControl {
    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Mark `offset` processed. Rejected once the batch went stale.
    pub fn resolve_offset(&self, offset: Offset) -> Result<()> {
        let accepted = !self.is_stale()
            && self
                .tracker
                .resolve_in(&self.partition, offset, self.generation)
                .is_ok();
        if !accepted {
            metrics::counter!(STALE_RESOLUTIONS_REJECTED).increment(1);
            return Err(ConsumerError::StaleOperation(self.partition.clone()));
        }
        Ok(())
    }

    pub async fn commit_offsets(
        &self,
        offsets: Option<HashMap<TopicPartition, Offset>>,
    ) -> Result<usize> {
        let result = self.scheduler.commit(offsets).await;
        if matches!(
            result,
            Err(ConsumerError::CommitFailure(BrokerError::RebalanceInProgress))
        ) {
            self.rebalance_requested.store(true, Ordering::SeqCst);
        }
        result
    }

    pub async fn commit_offsets_if_necessary(&self) -> Result<bool> {
        match self.scheduler.commit_if_necessary().await {
            Err(ConsumerError::CommitFailure(BrokerError::RebalanceInProgress)) => {
                self.rebalance_requested.store(true, Ordering::SeqCst);
                Ok(false)
            }
            other => other,
        }
    }

    /// Heartbeat now. A pending rebalance is recorded and handled once the
    /// handler returns; `is_running` turns false so the handler can stop early.
    pub async fn heartbeat(&self) -> Result<()> {
        match self.heartbeat.beat().await {
            Ok(()) => Ok(()),
            Err(BrokerError::RebalanceInProgress) => {
                self.rebalance_requested.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(BrokerError::SessionExpired) => {
                self.session_expired.store(true, Ordering::SeqCst);
                Err(ConsumerError::SessionExpired)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pause this batch's partition; the dispatcher stops after the handler returns
    pub fn pause(&self) -> ResumeHandle {
        self.controller.pause(&self.partition)
    }

    pub fn is_stale(&self) -> bool {
        self.control.is_stale(self.epoch)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
            && !self.is_stale()
            && !self.rebalance_requested.load(Ordering::SeqCst)
    }

    pub fn uncommitted_offsets(&self) -> HashMap<TopicPartition, Offset> {
        self.tracker.snapshot_uncommitted()
    }
}

impl fmt::Debug for BatchControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchControl")
            .field("partition", &self.partition)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}
