//! Configuration
//!
//! YAML configuration for the `argus` binary. The orchestration core never
//! reads files itself; this module turns operator input into the typed values
//! the core takes ([`SchedulerConfig`](crate::scheduler::SchedulerConfig),
//! [`CollectorRegistry`](crate::collector::CollectorRegistry), target lists).
//!
//! ```yaml
//! run:
//!   batch_size: 50
//!   pipeline_depth: 2
//!   max_concurrency: 32
//!   output_dir: ${ARGUS_HOME:-.}/output
//!   checkpoint_dir: ${ARGUS_HOME:-.}/checkpoints
//! throttle:
//!   cpu_high: 85
//!   memory_high: 90
//!   recovery_window: 10s
//! pool:
//!   session_ttl: 5m
//! retry:
//!   max_attempts: 3
//!   base_delay: 200ms
//!   backoff: exponential
//! collectors:
//!   tcp:
//!     - name: ssh
//!       port: 22
//! ```

mod app;
mod collector;
mod targets;
mod validation;

pub use app::{
    AppConfig, DEFAULT_CHECKPOINT_DIR, DEFAULT_OUTPUT_DIR, MonitorConfig, PoolConfig, RunConfig,
    SinkConfig,
};
pub use collector::CollectorsConfig;
pub use targets::{load_targets, parse_targets};
pub use validation::{ConfigError, expand_env_vars, parse_duration};
