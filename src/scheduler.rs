//! Batch Scheduler
//!
//! Drives a whole run: partitions targets into batches, keeps up to
//! `pipeline_depth` batches in flight on the [`WorkerPool`], adjusts the
//! pool's concurrency from host pressure before every admission, and writes
//! a checkpoint each time the completed prefix of batches grows.
//!
//! # Ordering
//!
//! Batches may finish out of order. A finished batch is held back until all
//! of its predecessors finish, so `last_completed_batch_index` only grows and
//! every target listed in a checkpoint belongs to a batch at or below it.
//!
//! # Failure handling
//!
//! Task failures are results, never errors. Broken components (checkpoint
//! store, result sink) stop admission, cancel in-flight work and surface as a
//! [`SchedulerError`]. Cancelling the run token stops admission, writes a
//! non-final checkpoint, finalizes the sink and returns a summary flagged
//! `aborted`.

mod throttle;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{ErrorClass, ErrorSnapshot};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::collector::Collector;
use crate::engine::{EngineError, EngineStats, WorkerPool};
use crate::model::{Batch, BatchIndex, CollectorTask, Target, TaskStatus, partition};
use crate::monitor::{MonitorSummary, ResourceMonitor};
use crate::pool::PoolStats;
use crate::retry::RetryPolicy;
use crate::sink::{SinkError, SinkStats};

pub use throttle::{Decision, ThrottleAction, ThrottleConfig, ThrottleController};

/// Default targets per batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default number of batches in flight.
pub const DEFAULT_PIPELINE_DEPTH: usize = 2;

/// Default concurrency ceiling.
pub const DEFAULT_MAX_CONCURRENCY: usize = 32;

// =============================================================================
// Errors
// =============================================================================

/// Fatal run errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Checkpoint could not be loaded or saved.
    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// A task could not deliver its result.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The sink failed to flush or finalize.
    #[error("result sink failed: {0}")]
    Sink(#[from] SinkError),

    /// Host pressure stayed critical past the pause limit.
    #[error("resources exhausted: paused for {paused_for:?} at concurrency 1")]
    ResourceExhausted { paused_for: Duration },

    /// Resume checkpoint was written for a different partitioning.
    #[error(
        "checkpoint covers {found} batches but this run has {expected}; target list or batch size changed"
    )]
    IncompatibleCheckpoint { expected: u64, found: u64 },

    /// Nothing to run against the targets.
    #[error("no collectors selected")]
    NoCollectors,

    /// A batch driver task died.
    #[error("internal scheduler error: {0}")]
    Internal(String),
}

impl From<JoinError> for SchedulerError {
    fn from(e: JoinError) -> Self {
        Self::Internal(format!("batch task failed: {e}"))
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Immutable scheduler settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Run identifier; also names the checkpoint and result files.
    pub run_id: String,
    /// Targets per batch.
    pub batch_size: usize,
    /// Batches in flight at once.
    pub pipeline_depth: usize,
    /// Concurrency ceiling; the run starts here.
    pub max_concurrency: usize,
    /// Retry policy applied to every task.
    pub retry: RetryPolicy,
    /// Pressure thresholds and pacing.
    pub throttle: ThrottleConfig,
}

impl SchedulerConfig {
    /// Defaults for `run_id`.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
            throttle: ThrottleConfig::default(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Run options using this config's batch size and pipeline depth.
    pub fn run_options(&self) -> RunOptions {
        RunOptions::new(self.batch_size, self.pipeline_depth)
    }
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Targets per batch (minimum 1).
    pub batch_size: usize,
    /// Batches in flight (minimum 1).
    pub pipeline_depth: usize,
    /// Continue from the latest checkpoint.
    pub resume: bool,
    /// Cancelling this token aborts the run.
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new(batch_size: usize, pipeline_depth: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pipeline_depth: pipeline_depth.max(1),
            resume: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

// =============================================================================
// Run state and summary
// =============================================================================

/// Observable run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    /// Running with reduced concurrency.
    Throttled,
    /// Admission stopped on critical pressure.
    Paused,
    Completed,
    Aborted,
    Failed,
}

/// End-of-run report.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Targets given to the run.
    pub total_targets: usize,
    /// Batches after partitioning.
    pub total_batches: u64,
    /// Batches executed to completion by this invocation.
    pub batches_completed: u64,
    /// Batches skipped because a checkpoint already covered them.
    pub batches_skipped: u64,
    /// Targets skipped because a checkpoint already covered them.
    pub targets_skipped: usize,
    /// Checkpointed prefix at the end of the run.
    pub last_completed_batch_index: BatchIndex,
    /// Task results produced by this invocation.
    pub tasks: u64,
    pub succeeded: u64,
    pub partial: u64,
    pub failed: u64,
    /// Failures by class.
    pub failures_by_class: BTreeMap<ErrorClass, u64>,
    /// Full aggregator view.
    pub errors: ErrorSnapshot,
    /// Where results were written.
    pub output_location: String,
    /// Run was cancelled before finishing.
    pub aborted: bool,
    /// Run paused at least once.
    pub paused: bool,
    pub pauses: u64,
    pub paused_ms: u64,
    pub throttle_decreases: u64,
    pub throttle_increases: u64,
    /// Concurrency limit when the run ended.
    pub final_concurrency: usize,
    pub engine: EngineStats,
    pub pool: PoolStats,
    pub sink: SinkStats,
    pub monitor: MonitorSummary,
}

// =============================================================================
// Progress tracking
// =============================================================================

/// Contiguous-prefix tracker for batch completion.
#[derive(Debug, Default)]
struct Progress {
    next: BatchIndex,
    last: BatchIndex,
    held: BTreeMap<BatchIndex, Vec<String>>,
    completed_targets: BTreeSet<String>,
}

impl Progress {
    fn new(completed_targets: BTreeSet<String>) -> Self {
        Self {
            next: 1,
            completed_targets,
            ..Self::default()
        }
    }

    /// Mark `index` complete. Returns true when the checkpointable prefix grew.
    fn complete(&mut self, index: BatchIndex, targets: Vec<String>) -> bool {
        self.held.insert(index, targets);
        let mut advanced = false;
        while let Some(targets) = self.held.remove(&self.next) {
            self.completed_targets.extend(targets);
            self.last = self.next;
            self.next += 1;
            advanced = true;
        }
        advanced
    }
}

/// What one batch produced.
#[derive(Debug)]
struct BatchReport {
    index: BatchIndex,
    targets: Vec<String>,
    tasks: u64,
    succeeded: u64,
    partial: u64,
    failed: u64,
    /// Cancellation reached the batch; its results are not all genuine.
    interrupted: bool,
    error: Option<SchedulerError>,
}

/// Mutable state of one `run_with` call.
struct RunContext {
    run_id: String,
    total_batches: u64,
    progress: Progress,
    batches_completed: u64,
    tasks: u64,
    succeeded: u64,
    partial: u64,
    failed: u64,
    constrained: bool,
    pauses: u64,
    paused_for: Duration,
}

impl RunContext {
    fn absorb(&mut self, report: &BatchReport) {
        self.tasks += report.tasks;
        self.succeeded += report.succeeded;
        self.partial += report.partial;
        self.failed += report.failed;
    }
}

/// Why the admission loop stopped early.
enum Stop {
    Cancelled,
    Fatal(SchedulerError),
}

impl From<SchedulerError> for Stop {
    fn from(e: SchedulerError) -> Self {
        Stop::Fatal(e)
    }
}

impl From<SinkError> for Stop {
    fn from(e: SinkError) -> Self {
        Stop::Fatal(e.into())
    }
}

impl From<JoinError> for Stop {
    fn from(e: JoinError) -> Self {
        Stop::Fatal(e.into())
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives batches of collector tasks through a [`WorkerPool`].
pub struct BatchScheduler {
    config: SchedulerConfig,
    engine: Arc<WorkerPool>,
    monitor: Arc<ResourceMonitor>,
    checkpoints: Arc<dyn CheckpointStore>,
    state: watch::Sender<RunState>,
}

impl BatchScheduler {
    pub fn new(
        config: SchedulerConfig,
        engine: Arc<WorkerPool>,
        monitor: Arc<ResourceMonitor>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            config,
            engine,
            monitor,
            checkpoints,
            state,
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Worker pool driven by this scheduler.
    pub fn engine(&self) -> &Arc<WorkerPool> {
        &self.engine
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Run every collector against every target.
    pub async fn run(
        &self,
        targets: Vec<Target>,
        collectors: Vec<Arc<dyn Collector>>,
        batch_size: usize,
        pipeline_depth: usize,
    ) -> Result<RunSummary, SchedulerError> {
        self.run_with(
            targets,
            collectors,
            RunOptions::new(batch_size, pipeline_depth),
        )
        .await
    }

    /// Run with explicit options (resume, cancellation).
    pub async fn run_with(
        &self,
        targets: Vec<Target>,
        collectors: Vec<Arc<dyn Collector>>,
        options: RunOptions,
    ) -> Result<RunSummary, SchedulerError> {
        if collectors.is_empty() {
            return Err(SchedulerError::NoCollectors);
        }
        let started = Instant::now();
        let started_at = Utc::now();
        let batches = partition(&targets, options.batch_size);
        let total_batches = batches.len() as u64;

        let mut previous_final = false;
        let mut completed = BTreeSet::new();
        if options.resume {
            match self.checkpoints.load().await? {
                Some(cp) => {
                    if cp.total_batches != total_batches {
                        return Err(SchedulerError::IncompatibleCheckpoint {
                            expected: total_batches,
                            found: cp.total_batches,
                        });
                    }
                    tracing::info!(
                        run_id = %self.config.run_id,
                        last_completed = cp.last_completed_batch_index,
                        completed_targets = cp.completed_targets.len(),
                        is_final = cp.is_final,
                        "Resuming from checkpoint"
                    );
                    previous_final = cp.is_final;
                    completed = cp.completed_targets;
                }
                None => {
                    tracing::info!(run_id = %self.config.run_id, "No checkpoint found, starting fresh");
                }
            }
        }

        let mut ctx = RunContext {
            run_id: self.config.run_id.clone(),
            total_batches,
            progress: Progress::new(completed),
            batches_completed: 0,
            tasks: 0,
            succeeded: 0,
            partial: 0,
            failed: 0,
            constrained: false,
            pauses: 0,
            paused_for: Duration::ZERO,
        };

        let mut pending = Vec::with_capacity(batches.len());
        let mut batches_skipped = 0u64;
        let mut targets_skipped = 0usize;
        for batch in batches {
            let remaining: Vec<Target> = batch
                .targets
                .iter()
                .filter(|t| !ctx.progress.completed_targets.contains(t.id()))
                .cloned()
                .collect();
            targets_skipped += batch.len() - remaining.len();
            if remaining.is_empty() {
                batches_skipped += 1;
                ctx.progress.complete(batch.index, Vec::new());
            } else {
                pending.push(Batch {
                    index: batch.index,
                    targets: remaining,
                });
            }
        }

        self.engine
            .set_concurrency_limit(self.config.max_concurrency);
        let mut throttle =
            ThrottleController::new(self.config.throttle.clone(), self.config.max_concurrency);
        let collectors: Arc<[Arc<dyn Collector>]> = collectors.into();
        let run_cancel = options.cancel.child_token();
        let mut in_flight = JoinSet::new();
        let nothing_to_do = pending.is_empty();

        self.state.send_replace(RunState::Running);
        tracing::info!(
            run_id = %ctx.run_id,
            targets = targets.len(),
            batches = total_batches,
            pending = pending.len(),
            batches_skipped,
            targets_skipped,
            collectors = collectors.len(),
            "Run started"
        );

        let driven = self
            .drive(
                &mut ctx,
                pending,
                &collectors,
                options.pipeline_depth,
                &run_cancel,
                &mut in_flight,
                &mut throttle,
            )
            .await;

        let aborted = match driven {
            Ok(()) => {
                if !(nothing_to_do && previous_final)
                    && let Err(e) = self.checkpoint(&mut ctx, true).await
                {
                    return Err(self.fail(e).await);
                }
                false
            }
            Err(stop) => {
                run_cancel.cancel();
                self.drain(&mut ctx, &mut in_flight).await;
                match stop {
                    Stop::Cancelled => {
                        tracing::warn!(
                            run_id = %ctx.run_id,
                            last_completed = ctx.progress.last,
                            "Run cancelled"
                        );
                        if let Err(e) = self.checkpoint(&mut ctx, false).await {
                            return Err(self.fail(e).await);
                        }
                        true
                    }
                    Stop::Fatal(err) => {
                        if matches!(err, SchedulerError::ResourceExhausted { .. })
                            && let Err(e) = self.checkpoint(&mut ctx, false).await
                        {
                            tracing::error!(error = %e, "Checkpoint after pause limit failed");
                        }
                        return Err(self.fail(err).await);
                    }
                }
            }
        };

        let output_location = match self.engine.sink().finalize().await {
            Ok(location) => location,
            Err(e) => return Err(self.fail(e.into()).await),
        };

        let errors = self.engine.aggregator().snapshot();
        let summary = RunSummary {
            run_id: ctx.run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            total_targets: targets.len(),
            total_batches,
            batches_completed: ctx.batches_completed,
            batches_skipped,
            targets_skipped,
            last_completed_batch_index: ctx.progress.last,
            tasks: ctx.tasks,
            succeeded: ctx.succeeded,
            partial: ctx.partial,
            failed: ctx.failed,
            failures_by_class: errors.counts_by_class.clone(),
            errors,
            output_location,
            aborted,
            paused: ctx.pauses > 0,
            pauses: ctx.pauses,
            paused_ms: ctx.paused_for.as_millis() as u64,
            throttle_decreases: throttle.decreases(),
            throttle_increases: throttle.increases(),
            final_concurrency: self.engine.concurrency_limit(),
            engine: self.engine.stats(),
            pool: self.engine.sessions().stats(),
            sink: self.engine.sink().stats(),
            monitor: self.monitor.summary(),
        };

        self.state.send_replace(if aborted {
            RunState::Aborted
        } else {
            RunState::Completed
        });
        tracing::info!(
            run_id = %summary.run_id,
            tasks = summary.tasks,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            aborted,
            elapsed_ms = summary.elapsed_ms,
            "Run finished"
        );
        Ok(summary)
    }

    /// Admission loop: one batch at a time, bounded by `depth` in flight.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        ctx: &mut RunContext,
        pending: Vec<Batch>,
        collectors: &Arc<[Arc<dyn Collector>]>,
        depth: usize,
        cancel: &CancellationToken,
        in_flight: &mut JoinSet<BatchReport>,
        throttle: &mut ThrottleController,
    ) -> Result<(), Stop> {
        for batch in pending {
            loop {
                if cancel.is_cancelled() {
                    return Err(Stop::Cancelled);
                }
                while let Some(joined) = in_flight.try_join_next() {
                    self.on_report(ctx, joined).await?;
                }
                if in_flight.len() < depth {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Stop::Cancelled),
                    Some(joined) = in_flight.join_next() => self.on_report(ctx, joined).await?,
                }
            }

            self.admit(ctx, throttle, in_flight, cancel).await?;

            tracing::debug!(
                batch = batch.index,
                targets = batch.len(),
                concurrency = self.engine.concurrency_limit(),
                in_flight = in_flight.len() + 1,
                "Batch admitted"
            );
            in_flight.spawn(run_batch(
                Arc::clone(&self.engine),
                batch,
                Arc::clone(collectors),
                self.config.retry,
                cancel.child_token(),
            ));
        }

        while !in_flight.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Stop::Cancelled),
                Some(joined) = in_flight.join_next() => self.on_report(ctx, joined).await?,
            }
        }
        Ok(())
    }

    /// Consult the monitor, apply the throttle and wait out backoff or pause.
    async fn admit(
        &self,
        ctx: &mut RunContext,
        throttle: &mut ThrottleController,
        in_flight: &mut JoinSet<BatchReport>,
        cancel: &CancellationToken,
    ) -> Result<(), Stop> {
        let mut paused_at: Option<Instant> = None;
        loop {
            let pressure = self.monitor.current_pressure();
            let action = throttle.observe(&pressure, Instant::now());

            match action.decision {
                Decision::Decrease => tracing::warn!(
                    cpu = pressure.cpu_percent,
                    memory = pressure.memory_percent,
                    concurrency = action.concurrency,
                    backoff_ms = action.backoff.as_millis() as u64,
                    "Resource pressure high, reducing concurrency"
                ),
                Decision::Increase => tracing::info!(
                    cpu = pressure.cpu_percent,
                    memory = pressure.memory_percent,
                    concurrency = action.concurrency,
                    "Resource pressure low, raising concurrency"
                ),
                Decision::Hold | Decision::Pause => {}
            }
            self.engine.set_concurrency_limit(action.concurrency);
            if action.constrained != ctx.constrained {
                ctx.constrained = action.constrained;
                self.engine.sink().set_constrained(action.constrained).await?;
            }

            if action.decision != Decision::Pause {
                if let Some(since) = paused_at {
                    ctx.paused_for += since.elapsed();
                    tracing::info!(
                        paused_ms = since.elapsed().as_millis() as u64,
                        "Resource pressure below critical, resuming admission"
                    );
                }
                self.state.send_replace(if ctx.constrained {
                    RunState::Throttled
                } else {
                    RunState::Running
                });
                if !action.backoff.is_zero() {
                    self.wait(ctx, action.backoff, in_flight, cancel).await?;
                }
                return Ok(());
            }

            let since = match paused_at {
                Some(since) => since,
                None => {
                    ctx.pauses += 1;
                    self.state.send_replace(RunState::Paused);
                    tracing::warn!(
                        cpu = pressure.cpu_percent,
                        memory = pressure.memory_percent,
                        max_pause_ms = throttle.config().max_pause.as_millis() as u64,
                        "Critical resource pressure at concurrency 1, pausing admission"
                    );
                    *paused_at.insert(Instant::now())
                }
            };
            let waited = since.elapsed();
            let max_pause = throttle.config().max_pause;
            if waited >= max_pause {
                ctx.paused_for += waited;
                return Err(Stop::Fatal(SchedulerError::ResourceExhausted {
                    paused_for: waited,
                }));
            }
            let poll = throttle.config().pause_poll.min(max_pause - waited);
            self.wait(ctx, poll, in_flight, cancel).await?;
        }
    }

    /// Sleep for `duration` while still processing finished batches.
    async fn wait(
        &self,
        ctx: &mut RunContext,
        duration: Duration,
        in_flight: &mut JoinSet<BatchReport>,
        cancel: &CancellationToken,
    ) -> Result<(), Stop> {
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Stop::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.on_report(ctx, joined).await?;
                }
            }
        }
    }

    /// Fold a finished batch into the run and checkpoint when the prefix grows.
    async fn on_report(
        &self,
        ctx: &mut RunContext,
        joined: Result<BatchReport, JoinError>,
    ) -> Result<(), Stop> {
        let mut report = joined?;
        ctx.absorb(&report);
        if let Some(err) = report.error.take() {
            return Err(Stop::Fatal(err));
        }
        if report.interrupted {
            tracing::debug!(batch = report.index, "Batch interrupted, not checkpointed");
            return Ok(());
        }

        ctx.batches_completed += 1;
        let index = report.index;
        if ctx.progress.complete(index, report.targets) {
            // Results must be durable before the checkpoint claims them.
            self.engine.sink().flush().await?;
            self.checkpoint(ctx, false).await?;
        } else {
            tracing::debug!(
                batch = index,
                waiting_for = ctx.progress.next,
                "Batch finished out of order, holding checkpoint"
            );
        }
        tracing::info!(
            run_id = %ctx.run_id,
            batch = index,
            checkpointed = ctx.progress.last,
            total = ctx.total_batches,
            completed_targets = ctx.progress.completed_targets.len(),
            tasks = report.tasks,
            failed = report.failed,
            "Batch complete"
        );
        Ok(())
    }

    async fn checkpoint(&self, ctx: &mut RunContext, is_final: bool) -> Result<(), SchedulerError> {
        if is_final {
            self.engine.sink().flush().await?;
        }
        let checkpoint = Checkpoint::new(
            ctx.run_id.clone(),
            ctx.progress.last,
            ctx.progress.completed_targets.clone(),
            ctx.total_batches,
        )
        .with_final(is_final);
        self.checkpoints.save(&checkpoint).await?;
        Ok(())
    }

    /// Wait for in-flight batches after cancellation, keeping their progress.
    async fn drain(&self, ctx: &mut RunContext, in_flight: &mut JoinSet<BatchReport>) {
        while let Some(joined) = in_flight.join_next().await {
            if let Err(Stop::Fatal(e)) = self.on_report(ctx, joined).await {
                tracing::warn!(error = %e, "Error while draining in-flight batches");
            }
        }
    }

    /// Mark the run failed, finalize the sink best-effort and hand back `err`.
    async fn fail(&self, err: SchedulerError) -> SchedulerError {
        tracing::error!(run_id = %self.config.run_id, error = %err, "Run failed");
        if let Err(e) = self.engine.sink().finalize().await {
            tracing::warn!(error = %e, "Sink finalize after failure also failed");
        }
        self.state.send_replace(RunState::Failed);
        err
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Submit every (target, collector) task of `batch` and wait for all of them.
async fn run_batch(
    engine: Arc<WorkerPool>,
    batch: Batch,
    collectors: Arc<[Arc<dyn Collector>]>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> BatchReport {
    let mut report = BatchReport {
        index: batch.index,
        targets: batch.targets.iter().map(|t| t.id().to_owned()).collect(),
        tasks: 0,
        succeeded: 0,
        partial: 0,
        failed: 0,
        interrupted: false,
        error: None,
    };

    let mut tasks = JoinSet::new();
    for target in batch.targets {
        for collector in collectors.iter() {
            let task = CollectorTask::new(batch.index, target.clone(), Arc::clone(collector), retry);
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            tasks.spawn(async move { engine.submit(task, &cancel).await });
        }
    }

    while let Some(joined) = tasks.join_next().await {
        report.tasks += 1;
        match joined {
            Ok(Ok(result)) => match result.status() {
                TaskStatus::Success => report.succeeded += 1,
                TaskStatus::PartialSuccess => report.partial += 1,
                TaskStatus::Failure => report.failed += 1,
            },
            Ok(Err(e)) => {
                report.failed += 1;
                report.error.get_or_insert(e.into());
            }
            Err(e) => {
                report.failed += 1;
                report.error.get_or_insert(e.into());
            }
        }
    }
    report.interrupted = cancel.is_cancelled();
    report
}
