//! Argus - Fleet Audit Orchestration
//!
//! Runs many small data-gathering probes (collectors) against a fleet of
//! remote machines and streams the results to disk. The crate is the
//! orchestration core: how much runs at once, how flaky connections are
//! tolerated, how memory stays bounded at fleet scale, and how an interrupted
//! run picks up where it stopped.
//!
//! # Architecture
//!
//! - **Scheduler** ([`scheduler`]): batches, pipelining, throttling, checkpoints, resume
//! - **Engine** ([`engine`]): bounded-concurrency task execution with deadlines
//! - **Retry** ([`retry`]): backoff, transient/terminal classification, fallback chains
//! - **Pool** ([`pool`]): TTL-bound session reuse per target
//! - **Monitor** ([`monitor`]): smoothed host CPU/memory pressure
//! - **Sink** ([`sink`]): streaming JSON Lines writer with backpressure
//! - **Checkpoint** ([`checkpoint`]): atomic, ordered progress records
//! - **Aggregate** ([`aggregate`]): failure classification and top issues
//! - **Collectors** ([`collector`]): capability trait, registry, TCP probe
//! - **Config** ([`config`]): YAML configuration and target lists
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use argus::{
//!     AppConfig, BatchScheduler, ConnectionPool, ErrorAggregator, FileCheckpointStore,
//!     ResourceMonitor, WorkerPool, load_targets,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load("argus.yaml")?;
//!     let targets = load_targets("fleet.txt")?;
//!     let run_id = "nightly-audit";
//!
//!     let engine = Arc::new(WorkerPool::new(
//!         config.run.max_concurrency,
//!         Arc::new(ConnectionPool::new(config.pool.session_ttl)),
//!         config.sink_builder(run_id).build().await?,
//!         Arc::new(ErrorAggregator::new()),
//!     ));
//!     let monitor = Arc::new(ResourceMonitor::new());
//!     monitor.start(config.monitor.interval);
//!
//!     let scheduler = BatchScheduler::new(
//!         config.scheduler_config(run_id),
//!         engine,
//!         monitor,
//!         Arc::new(FileCheckpointStore::new(config.checkpoint_dir(), run_id)),
//!     );
//!     let collectors = config.collectors.registry()?.all();
//!     let summary = scheduler
//!         .run(targets, collectors, config.run.batch_size, config.run.pipeline_depth)
//!         .await?;
//!     println!("{} tasks, {} failed", summary.tasks, summary.failed);
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod engine;
pub mod model;
pub mod monitor;
pub mod pool;
pub mod retry;
pub mod scheduler;
pub mod sink;
mod sync;

// Re-export commonly used types
pub use aggregate::{Classify, ErrorAggregator, ErrorClass, ErrorSnapshot, top_issues};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore};
pub use collector::tcp::{TcpCollector, TcpConfig};
pub use collector::{CollectContext, Collector, CollectorError, CollectorMeta, CollectorRegistry};
pub use config::{AppConfig, ConfigError, load_targets};
pub use engine::{EngineError, EngineStats, WorkerPool};
pub use model::{Batch, BatchIndex, CollectorTask, Target, TaskId, TaskOutcome, TaskResult, TaskStatus, partition};
pub use monitor::{ResourceMonitor, ResourcePressure};
pub use pool::{ConnectionPool, PoolError, PoolStats, ResolvingConnector};
pub use retry::{BackoffStrategy, RetryError, RetryExecutor, RetryPolicy, StrategyChain};
pub use scheduler::{BatchScheduler, RunOptions, RunState, RunSummary, SchedulerConfig, SchedulerError};
pub use sink::{ResultSink, SinkBuilder, SinkError};
