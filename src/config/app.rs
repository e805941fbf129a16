//! Application configuration structures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::monitor::{DEFAULT_SAMPLE_INTERVAL, DEFAULT_SMOOTHING, DEFAULT_WINDOW};
use crate::pool::{DEFAULT_RESOLVE_PORT, DEFAULT_SESSION_TTL};
use crate::retry::RetryPolicy;
use crate::scheduler::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENCY, DEFAULT_PIPELINE_DEPTH, SchedulerConfig,
    ThrottleConfig,
};
use crate::sink::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CHANNEL_CAPACITY, DEFAULT_FLUSH_INTERVAL, SinkBuilder,
    results_path,
};

use super::collector::CollectorsConfig;
use super::validation::{
    ConfigError, expand_env_vars, require_nonzero_duration, require_percent, require_positive,
};

/// Default result output directory.
pub const DEFAULT_OUTPUT_DIR: &str = "./argus-output";

/// Default checkpoint directory.
pub const DEFAULT_CHECKPOINT_DIR: &str = "./argus-checkpoints";

// =============================================================================
// Run Configuration
// =============================================================================

/// Batching, concurrency and on-disk locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Targets per batch (default: 50).
    pub batch_size: usize,
    /// Batches in flight at once (default: 2).
    pub pipeline_depth: usize,
    /// Concurrency ceiling (default: 32).
    pub max_concurrency: usize,
    /// Result directory; `${VAR:-default}` is expanded.
    pub output_dir: String,
    /// Checkpoint directory; `${VAR:-default}` is expanded.
    pub checkpoint_dir: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            checkpoint_dir: DEFAULT_CHECKPOINT_DIR.to_string(),
        }
    }
}

// =============================================================================
// Component Configuration
// =============================================================================

/// Session pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Session lifetime; 0 disables reuse (default: 5m).
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
    /// Port used for name resolution when a target has none (default: 22).
    pub resolve_port: u16,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            session_ttl: DEFAULT_SESSION_TTL,
            resolve_port: DEFAULT_RESOLVE_PORT,
        }
    }
}

/// Resource monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sample period (default: 1s).
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Samples kept (default: 30).
    pub window: usize,
    /// Samples averaged into the pressure signal (default: 3).
    pub smoothing: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SAMPLE_INTERVAL,
            window: DEFAULT_WINDOW,
            smoothing: DEFAULT_SMOOTHING,
        }
    }
}

/// Result sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Records buffered before a write (default: 500).
    pub buffer_size: usize,
    /// Longest a record waits in the buffer (default: 1s).
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Queue between tasks and the writer (default: 1024).
    pub channel_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Retry policy applied to every task and to name resolution.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    /// Collector configurations grouped by type.
    #[serde(default)]
    pub collectors: CollectorsConfig,
    /// Directory with additional collector config files.
    #[serde(default)]
    pub collector_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse, expand paths and validate.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(content)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration including the `collector_path` directory.
    pub fn load_with_collector_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;

        if let Some(ref collector_dir) = config.collector_path {
            let additional = CollectorsConfig::load_from_dir(collector_dir)?;
            config.collectors = config.collectors.merge(additional);
        }

        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) {
        self.run.output_dir = expand_env_vars(&self.run.output_dir);
        self.run.checkpoint_dir = expand_env_vars(&self.run.checkpoint_dir);
        if let Some(dir) = self.collector_path.as_mut() {
            *dir = expand_env_vars(dir);
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("run.batch_size", self.run.batch_size)?;
        require_positive("run.pipeline_depth", self.run.pipeline_depth)?;
        require_positive("run.max_concurrency", self.run.max_concurrency)?;
        if self.run.output_dir.trim().is_empty() || self.run.checkpoint_dir.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "run.output_dir and run.checkpoint_dir cannot be empty".to_string(),
            ));
        }

        self.validate_throttle()?;

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationError(
                "retry.base_delay cannot exceed retry.max_delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::ValidationError(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }

        require_nonzero_duration("monitor.interval", self.monitor.interval)?;
        require_positive("monitor.window", self.monitor.window)?;
        require_positive("monitor.smoothing", self.monitor.smoothing)?;
        if self.monitor.smoothing > self.monitor.window {
            return Err(ConfigError::ValidationError(
                "monitor.smoothing cannot exceed monitor.window".to_string(),
            ));
        }

        require_positive("sink.buffer_size", self.sink.buffer_size)?;
        require_positive("sink.channel_capacity", self.sink.channel_capacity)?;
        require_nonzero_duration("sink.flush_interval", self.sink.flush_interval)?;

        self.collectors.validate()?;

        Ok(())
    }

    fn validate_throttle(&self) -> Result<(), ConfigError> {
        let t = &self.throttle;
        require_percent("throttle.cpu_high", t.cpu_high)?;
        require_percent("throttle.memory_high", t.memory_high)?;
        require_percent("throttle.cpu_low", t.cpu_low)?;
        require_percent("throttle.memory_low", t.memory_low)?;
        require_percent("throttle.cpu_critical", t.cpu_critical)?;
        require_percent("throttle.memory_critical", t.memory_critical)?;
        if t.cpu_low >= t.cpu_high || t.memory_low >= t.memory_high {
            return Err(ConfigError::ValidationError(
                "throttle low thresholds must be below high thresholds".to_string(),
            ));
        }
        if t.cpu_high > t.cpu_critical || t.memory_high > t.memory_critical {
            return Err(ConfigError::ValidationError(
                "throttle critical thresholds cannot be below high thresholds".to_string(),
            ));
        }
        require_positive("throttle.recovery_step", t.recovery_step)?;
        require_nonzero_duration("throttle.pause_poll", t.pause_poll)?;
        if t.base_backoff > t.max_backoff {
            return Err(ConfigError::ValidationError(
                "throttle.base_backoff cannot exceed throttle.max_backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// Immutable scheduler settings for `run_id`.
    pub fn scheduler_config(&self, run_id: impl Into<String>) -> SchedulerConfig {
        SchedulerConfig::new(run_id)
            .with_batch_size(self.run.batch_size)
            .with_pipeline_depth(self.run.pipeline_depth)
            .with_max_concurrency(self.run.max_concurrency)
            .with_retry(self.retry)
            .with_throttle(self.throttle.clone())
    }

    /// Sink builder writing `<output_dir>/<run_id>.results.jsonl`.
    pub fn sink_builder(&self, run_id: &str) -> SinkBuilder {
        SinkBuilder::new(results_path(&self.run.output_dir, run_id))
            .buffer_size(self.sink.buffer_size)
            .flush_interval(self.sink.flush_interval)
            .channel_capacity(self.sink.channel_capacity)
    }

    /// Checkpoint directory as a path.
    pub fn checkpoint_dir(&self) -> PathBuf {
        PathBuf::from(&self.run.checkpoint_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tcp::TcpConfig;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = AppConfig::from_yaml("{}").unwrap();
        assert_eq!(config.run.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.run.pipeline_depth, 2);
        assert_eq!(config.pool.session_ttl, Duration::from_secs(300));
        assert_eq!(config.throttle.cpu_high, 85.0);
        assert_eq!(config.throttle.memory_high, 90.0);
        assert_eq!(config.monitor.window, 30);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.collectors.tcp.is_empty());
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
run:
  batch_size: 25
  pipeline_depth: 3
  max_concurrency: 8
  output_dir: ${ARGUS_UNSET_OUT_5521:-/tmp/argus/out}
throttle:
  cpu_high: 80
  recovery_window: 30s
  max_pause: 2m
pool:
  session_ttl: 0s
retry:
  max_attempts: 5
  base_delay: 100ms
  backoff: linear
  jitter: 0.2
sink:
  buffer_size: 100
  flush_interval: 500ms
collectors:
  tcp:
    - name: ssh
      port: 22
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.run.output_dir, "/tmp/argus/out");
        assert_eq!(config.throttle.cpu_high, 80.0);
        assert_eq!(config.throttle.recovery_window, Duration::from_secs(30));
        assert_eq!(config.throttle.max_pause, Duration::from_secs(120));
        assert_eq!(config.pool.session_ttl, Duration::ZERO);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.sink.flush_interval, Duration::from_millis(500));

        let sc = config.scheduler_config("run-7");
        assert_eq!(sc.run_id, "run-7");
        assert_eq!(sc.batch_size, 25);
        assert_eq!(sc.pipeline_depth, 3);
        assert_eq!(sc.max_concurrency, 8);
        assert_eq!(sc.retry.max_attempts, 5);
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            "run: { batch_size: 0 }",
            "throttle: { cpu_low: 90, cpu_high: 85 }",
            "throttle: { cpu_high: 120 }",
            "throttle: { cpu_critical: 80 }",
            "retry: { max_attempts: 0 }",
            "retry: { jitter: 1.5 }",
            "monitor: { window: 2, smoothing: 3 }",
            "sink: { buffer_size: 0 }",
        ];
        for yaml in cases {
            let err = AppConfig::from_yaml(yaml).unwrap_err();
            assert!(
                matches!(err, ConfigError::ValidationError(_)),
                "{yaml} -> {err}"
            );
        }
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        assert!(matches!(
            AppConfig::from_yaml("run: [not, a, map]"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_with_collector_path() {
        let dir = tempfile::tempdir().unwrap();
        let extra = dir.path().join("collectors.d");
        std::fs::create_dir(&extra).unwrap();
        std::fs::write(extra.join("web.yaml"), "tcp:\n  - name: https\n    port: 443\n").unwrap();

        let main = dir.path().join("argus.yaml");
        std::fs::write(
            &main,
            format!(
                "collector_path: {}\ncollectors:\n  tcp:\n    - name: ssh\n      port: 22\n",
                extra.display()
            ),
        )
        .unwrap();

        let config = AppConfig::load_with_collector_path(&main).unwrap();
        let names: Vec<_> = config.collectors.tcp.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["ssh", "https"]);
    }

    #[test]
    fn test_sink_builder_path() {
        let mut config = AppConfig::default();
        config.run.output_dir = "/data/out".into();
        config.collectors.tcp.push(TcpConfig::new("ssh", 22));
        assert!(config.validate().is_ok());
        assert_eq!(
            results_path(&config.run.output_dir, "r1"),
            PathBuf::from("/data/out/r1.results.jsonl")
        );
        let _builder = config.sink_builder("r1");
    }
}
