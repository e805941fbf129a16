//! Worker Pool
//!
//! Executes collector tasks under a live concurrency limit. Each task:
//!
//! 1. waits for an execution slot ([`ConcurrencyLimiter`]),
//! 2. leases a session from the [`ConnectionPool`],
//! 3. runs the collector through a retry strategy chain (primary invocation,
//!    then the collector's degraded mode if it declares one),
//! 4. releases the session and the slot,
//! 5. records its single terminal [`TaskResult`] with the aggregator and the
//!    sink before [`WorkerPool::submit`] returns.
//!
//! The whole task is bound by its deadline, and run cancellation reaches it
//! at every stage: slot wait, session setup, invocation, and retry backoff.
//! Both end in the task's child token being cancelled. Collector panics are contained
//! and reported as unclassified failures. Task failures never surface as
//! errors; only a broken sink does.

mod limiter;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{Classify, ErrorAggregator, ErrorClass};
use crate::collector::{CollectContext, CollectorError};
use crate::model::{CollectorTask, TaskOutcome, TaskResult};
use crate::pool::{ConnectionPool, PoolError};
use crate::retry::{Attempted, RetryError, RetryExecutor, Strategy, StrategyChain};
use crate::sink::{ResultSink, SinkError};

pub use limiter::{ConcurrencyLimiter, Permit};

/// Component-level engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The result sink rejected a result.
    #[error("result sink failed: {0}")]
    Sink(#[from] SinkError),
}

/// Engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Tasks submitted.
    pub submitted: u64,
    /// Tasks that produced a terminal result.
    pub completed: u64,
    /// Full successes.
    pub succeeded: u64,
    /// Degraded successes.
    pub partial: u64,
    /// Failures of any class.
    pub failed: u64,
    /// Failures caused by the task deadline.
    pub timed_out: u64,
    /// Failures caused by run cancellation.
    pub cancelled: u64,
    /// Collector panics contained.
    pub panicked: u64,
    /// Slots in use now.
    pub active: usize,
    /// Current concurrency limit.
    pub limit: usize,
    /// Highest slot usage seen.
    pub peak_active: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    succeeded: AtomicU64,
    partial: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    panicked: AtomicU64,
}

/// How a task's execution ended, before it is turned into an outcome.
enum Execution {
    Done(Result<Attempted<serde_json::Value>, RetryError<CollectorError>>),
    Panicked(String),
    TimedOut,
}

/// Bounded-concurrency executor for collector tasks.
pub struct WorkerPool {
    limiter: Arc<ConcurrencyLimiter>,
    sessions: Arc<ConnectionPool>,
    sink: ResultSink,
    aggregator: Arc<ErrorAggregator>,
    counters: Counters,
}

impl WorkerPool {
    /// Create a pool admitting `limit` concurrent tasks.
    pub fn new(
        limit: usize,
        sessions: Arc<ConnectionPool>,
        sink: ResultSink,
        aggregator: Arc<ErrorAggregator>,
    ) -> Self {
        Self {
            limiter: Arc::new(ConcurrencyLimiter::new(limit)),
            sessions,
            sink,
            aggregator,
            counters: Counters::default(),
        }
    }

    /// Change the concurrency limit. Running tasks are never preempted.
    pub fn set_concurrency_limit(&self, limit: usize) {
        let previous = self.limiter.set_limit(limit);
        if previous != self.limiter.limit() {
            tracing::debug!(previous, limit = self.limiter.limit(), "Concurrency limit changed");
        }
    }

    /// Current concurrency limit.
    pub fn concurrency_limit(&self) -> usize {
        self.limiter.limit()
    }

    /// Session pool used by tasks.
    pub fn sessions(&self) -> &Arc<ConnectionPool> {
        &self.sessions
    }

    /// Result sink fed by tasks.
    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    /// Aggregator fed by tasks.
    pub fn aggregator(&self) -> &Arc<ErrorAggregator> {
        &self.aggregator
    }

    /// Current counters.
    pub fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            partial: c.partial.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            active: self.limiter.active(),
            limit: self.limiter.limit(),
            peak_active: self.limiter.peak(),
        }
    }

    /// Run `task` to its single terminal result.
    ///
    /// A task cancelled by `cancel` (before or during execution) still yields
    /// a result: an unclassified failure marked as cancelled.
    ///
    /// # Errors
    /// Only when the sink cannot accept the result.
    pub async fn submit(
        &self,
        task: CollectorTask,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, EngineError> {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let meta = task.collector.meta();
        let start = Instant::now();
        let attempts = Arc::new(AtomicU32::new(0));

        let execution = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.limiter.acquire() => Some(permit),
        };

        let execution = match execution {
            None => Execution::Done(Err(RetryError::Cancelled {
                last: None,
                attempts: 0,
            })),
            Some(_permit) => {
                let task_cancel = cancel.child_token();
                let run = AssertUnwindSafe(self.execute(&task, &task_cancel, &attempts))
                    .catch_unwind();
                let execution = tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => Execution::Done(Err(RetryError::Cancelled {
                        last: None,
                        attempts: attempts.load(Ordering::Relaxed),
                    })),
                    done = run => match done {
                        Ok(result) => Execution::Done(result),
                        Err(panic) => Execution::Panicked(panic_message(panic.as_ref())),
                    },
                    _ = tokio::time::sleep(task.timeout) => Execution::TimedOut,
                };
                task_cancel.cancel();
                execution
            }
        };

        let elapsed = start.elapsed();
        let outcome = match execution {
            Execution::Done(Ok(attempted)) if attempted.is_fallback() => {
                self.counters.partial.fetch_add(1, Ordering::Relaxed);
                TaskOutcome::PartialSuccess {
                    payload: attempted.value,
                    degraded_reason: attempted.fell_back_from.join("; "),
                    elapsed,
                }
            }
            Execution::Done(Ok(attempted)) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                TaskOutcome::Success {
                    payload: attempted.value,
                    elapsed,
                }
            }
            Execution::Done(Err(err)) if err.is_cancelled() => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                self.failure(ErrorClass::Unclassified, "cancelled".to_owned(), elapsed)
            }
            Execution::Done(Err(err)) => {
                let message = match err.last() {
                    Some(last) => last.to_string(),
                    None => err.to_string(),
                };
                self.failure(err.error_class(), message, elapsed)
            }
            Execution::Panicked(message) => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                tracing::error!(task = %task.id, panic = %message, "Collector panicked");
                self.failure(
                    ErrorClass::Unclassified,
                    format!("collector panicked: {message}"),
                    elapsed,
                )
            }
            Execution::TimedOut => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                self.failure(
                    ErrorClass::Timeout,
                    format!("deadline of {} exceeded", humantime::format_duration(task.timeout)),
                    elapsed,
                )
            }
        };

        let result = TaskResult {
            task_id: task.id,
            target: task.target,
            collector: meta.name,
            critical: meta.critical,
            batch: task.batch,
            attempts: attempts.load(Ordering::Relaxed),
            outcome,
            finished_at: Utc::now(),
        };
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            task = %result.task_id,
            status = %result.status(),
            attempts = result.attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "Task finished"
        );

        if !result.is_success() {
            self.aggregator.record(&result);
        }
        self.sink.push(&result).await?;
        Ok(result)
    }

    fn failure(&self, class: ErrorClass, message: String, elapsed: std::time::Duration) -> TaskOutcome {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        TaskOutcome::Failure {
            class,
            message,
            elapsed,
        }
    }

    /// Session lease, strategy chain, session release.
    async fn execute(
        &self,
        task: &CollectorTask,
        cancel: &CancellationToken,
        attempts: &Arc<AtomicU32>,
    ) -> Result<Attempted<serde_json::Value>, RetryError<CollectorError>> {
        let lease = match self.sessions.acquire(&task.target, cancel).await {
            Ok(lease) => lease,
            Err(PoolError::Cancelled(_)) => {
                return Err(RetryError::Cancelled {
                    last: None,
                    attempts: 0,
                });
            }
            Err(e) => {
                attempts.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(task = %task.id, error = %e, "Session acquire failed");
                return Err(RetryError::Terminal {
                    last: CollectorError::Session(e),
                    attempts: 1,
                });
            }
        };

        let context = |attempt: u32| CollectContext {
            target: task.target.clone(),
            session: Arc::clone(lease.handle()),
            attempt,
            cancel: cancel.clone(),
        };

        let primary = {
            let collector = Arc::clone(&task.collector);
            let attempts = Arc::clone(attempts);
            let context = context.clone();
            Strategy::new("primary", move |attempt| {
                attempts.fetch_add(1, Ordering::Relaxed);
                let collector = Arc::clone(&collector);
                let ctx = context(attempt);
                async move { collector.invoke(&ctx).await }.boxed()
            })
        };
        let mut chain = StrategyChain::new(primary);

        if task.collector.meta().degraded {
            let collector = Arc::clone(&task.collector);
            let attempts = Arc::clone(attempts);
            chain = chain.then(Strategy::new("degraded", move |attempt| {
                attempts.fetch_add(1, Ordering::Relaxed);
                let collector = Arc::clone(&collector);
                let ctx = context(attempt);
                async move {
                    collector
                        .invoke_degraded(&ctx)
                        .await
                        .unwrap_or(Err(CollectorError::NoFallback))
                }
                .boxed()
            }));
        }

        let result = RetryExecutor::new(task.retry)
            .execute_chain(cancel, chain)
            .await;

        match &result {
            Err(err) if err.error_class() == ErrorClass::Connectivity => {
                self.sessions.invalidate(lease);
            }
            _ => self.sessions.release(lease),
        }
        result
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{Collector, CollectorMeta};
    use crate::model::Target;
    use crate::pool::{Connector, PoolError};
    use crate::retry::RetryPolicy;
    use crate::sink::SinkBuilder;
    use std::net::SocketAddr;
    use std::time::Duration;

    struct LoopbackConnector;

    #[async_trait::async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(
            &self,
            _target: &Target,
            _cancel: &CancellationToken,
        ) -> Result<Vec<SocketAddr>, PoolError> {
            Ok(vec!["127.0.0.1:22".parse().unwrap()])
        }
    }

    /// Session setup that takes a minute and ignores cancellation itself.
    struct SlowConnector;

    #[async_trait::async_trait]
    impl Connector for SlowConnector {
        async fn connect(
            &self,
            _target: &Target,
            _cancel: &CancellationToken,
        ) -> Result<Vec<SocketAddr>, PoolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec!["127.0.0.1:22".parse().unwrap()])
        }
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Ok,
        FailThenOk(u32),
        Refused,
        Denied,
        Hang,
        Panic,
        DegradedOnly,
    }

    struct ScriptedCollector {
        behaviour: Behaviour,
        calls: AtomicU32,
    }

    impl ScriptedCollector {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Collector for ScriptedCollector {
        fn meta(&self) -> CollectorMeta {
            CollectorMeta::new("scripted")
                .with_timeout(Duration::from_secs(1))
                .with_degraded(matches!(self.behaviour, Behaviour::DegradedOnly))
        }

        async fn invoke(&self, ctx: &CollectContext) -> Result<serde_json::Value, CollectorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.behaviour {
                Behaviour::Ok => Ok(serde_json::json!({ "host": ctx.target.id() })),
                Behaviour::FailThenOk(k) if n <= k => Err(CollectorError::Io(
                    std::io::Error::from(std::io::ErrorKind::ConnectionReset),
                )),
                Behaviour::FailThenOk(_) => Ok(serde_json::json!({ "attempt": ctx.attempt })),
                Behaviour::Refused | Behaviour::DegradedOnly => Err(CollectorError::Io(
                    std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                )),
                Behaviour::Denied => Err(CollectorError::Auth("key rejected".into())),
                Behaviour::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Behaviour::Panic => panic!("probe exploded"),
            }
        }

        async fn invoke_degraded(
            &self,
            _ctx: &CollectContext,
        ) -> Option<Result<serde_json::Value, CollectorError>> {
            match self.behaviour {
                Behaviour::DegradedOnly => Some(Ok(serde_json::json!({ "degraded": true }))),
                _ => None,
            }
        }
    }

    async fn worker_pool(dir: &tempfile::TempDir, limit: usize) -> WorkerPool {
        worker_pool_with(dir, limit, Arc::new(LoopbackConnector)).await
    }

    async fn worker_pool_with(
        dir: &tempfile::TempDir,
        limit: usize,
        connector: Arc<dyn Connector>,
    ) -> WorkerPool {
        let sink = SinkBuilder::new(dir.path().join("out.jsonl"))
            .buffer_size(4)
            .build()
            .await
            .unwrap();
        WorkerPool::new(
            limit,
            Arc::new(ConnectionPool::with_connector(
                Duration::from_secs(60),
                connector,
            )),
            sink,
            Arc::new(ErrorAggregator::new()),
        )
    }

    fn task(collector: Arc<ScriptedCollector>, max_attempts: u32) -> CollectorTask {
        CollectorTask::new(
            1,
            Target::new("web01"),
            collector,
            RetryPolicy::default()
                .with_max_attempts(max_attempts)
                .with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_success_is_pushed_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let pool = worker_pool(&dir, 2).await;
        let result = pool
            .submit(task(ScriptedCollector::new(Behaviour::Ok), 3), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.attempts, 1);
        assert_eq!(pool.sink().stats().pushed, 1);
        assert_eq!(pool.aggregator().snapshot().total_failures(), 0);
        assert_eq!(pool.sessions().stats().active_leases, 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let pool = worker_pool(&dir, 2).await;
        let result = pool
            .submit(
                task(ScriptedCollector::new(Behaviour::FailThenOk(2)), 3),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_exact_attempt_bound() {
        let dir = tempfile::tempdir().unwrap();
        let pool = worker_pool(&dir, 2).await;
        let collector = ScriptedCollector::new(Behaviour::Refused);
        let result = pool
            .submit(task(Arc::clone(&collector), 4), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.error_class(), Some(ErrorClass::Connectivity));
        assert_eq!(result.attempts, 4);
        assert_eq!(collector.calls.load(Ordering::SeqCst), 4);
        assert_eq!(pool.aggregator().snapshot().total_failures(), 1);
        // Connectivity failures drop the cached session.
        assert_eq!(pool.sessions().stats().invalidated, 1);
    }

    #[tokio::test]
    async fn test_terminal_failure_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let pool = worker_pool(&dir, 2).await;
        let result = pool
            .submit(
                task(ScriptedCollector::new(Behaviour::Denied), 5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.error_class(), Some(ErrorClass::Authentication));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_degraded_mode_yields_partial_success() {
        let dir = tempfile::tempdir().unwrap();
        let pool = worker_pool(&dir, 2).await;
        let result = pool
            .submit(
                task(ScriptedCollector::new(Behaviour::DegradedOnly), 2),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match &result.outcome {
            TaskOutcome::PartialSuccess {
                payload,
                degraded_reason,
                ..
            } => {
                assert_eq!(payload["degraded"], true);
                assert!(degraded_reason.starts_with("primary: "));
            }
            other => panic!("expected partial success, got {other:?}"),
        }
        assert_eq!(result.attempts, 3);
        assert_eq!(pool.aggregator().snapshot().partial_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_timeout_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pool = worker_pool(&dir, 2).await;
        let result = pool
            .submit(
                task(ScriptedCollector::new(Behaviour::Hang), 1)
                    .with_timeout(Duration::from_millis(200)),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.error_class(), Some(ErrorClass::Timeout));
        assert_eq!(pool.stats().timed_out, 1);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let pool = worker_pool(&dir, 2).await;
        let result = pool
            .submit(
                task(ScriptedCollector::new(Behaviour::Panic), 3),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.error_class(), Some(ErrorClass::Unclassified));
        match &result.outcome {
            TaskOutcome::Failure { message, .. } => assert!(message.contains("probe exploded")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(pool.stats().panicked, 1);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_cancelled_task_still_reports() {
        let dir = tempfile::tempdir().unwrap();
        let pool = worker_pool(&dir, 1).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pool
            .submit(task(ScriptedCollector::new(Behaviour::Ok), 1), &cancel)
            .await
            .unwrap();
        assert!(result.is_failure());
        assert_eq!(pool.stats().cancelled, 1);
        assert_eq!(pool.sink().stats().pushed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cancel_interrupts_session_setup() {
        let dir = tempfile::tempdir().unwrap();
        let pool = worker_pool_with(&dir, 1, Arc::new(SlowConnector)).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = pool
            .submit(
                task(ScriptedCollector::new(Behaviour::Ok), 1)
                    .with_timeout(Duration::from_secs(120)),
                &cancel,
            )
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        match &result.outcome {
            TaskOutcome::Failure {
                class,
                message,
                elapsed,
            } => {
                assert_eq!(*class, ErrorClass::Unclassified);
                assert_eq!(message, "cancelled");
                assert!(*elapsed >= Duration::from_millis(50));
                assert!(*elapsed < Duration::from_secs(1));
            }
            other => panic!("expected cancellation failure, got {other:?}"),
        }
        assert_eq!(pool.stats().cancelled, 1);
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.sessions().stats().created, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cancel_interrupts_running_collector() {
        let dir = tempfile::tempdir().unwrap();
        let pool = worker_pool(&dir, 1).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = pool
            .submit(
                task(ScriptedCollector::new(Behaviour::Hang), 1)
                    .with_timeout(Duration::from_secs(120)),
                &cancel,
            )
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(result.error_class(), Some(ErrorClass::Unclassified));
        assert_eq!(pool.stats().cancelled, 1);
        assert_eq!(pool.stats().timed_out, 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(worker_pool(&dir, 3).await);
        let collector = ScriptedCollector::new(Behaviour::Ok);

        let mut set = tokio::task::JoinSet::new();
        for i in 0..20 {
            let pool = Arc::clone(&pool);
            let task = CollectorTask::new(
                1,
                Target::new(format!("host-{i}")),
                Arc::clone(&collector) as Arc<dyn Collector>,
                RetryPolicy::no_retry(),
            );
            set.spawn(async move { pool.submit(task, &CancellationToken::new()).await });
        }
        while let Some(res) = set.join_next().await {
            assert!(res.unwrap().unwrap().is_success());
        }

        let stats = pool.stats();
        assert_eq!(stats.completed, 20);
        assert!(stats.peak_active <= 3);
        pool.set_concurrency_limit(1);
        assert_eq!(pool.concurrency_limit(), 1);
    }
}
