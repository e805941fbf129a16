//! Resource Monitor
//!
//! Samples local CPU and memory utilisation on a fixed interval and exposes a
//! smoothed pressure value. Sampling runs in its own tokio task, independent
//! of any run; readers get the latest value from a `watch` channel without
//! taking a lock.
//!
//! Smoothing: [`ResourceMonitor::current_pressure`] is the arithmetic mean of
//! the most recent `smoothing` samples (default 3) in a 30-sample window.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::sync::lock;

/// Samples kept in the rolling window.
pub const DEFAULT_WINDOW: usize = 30;

/// Samples averaged into the current pressure.
pub const DEFAULT_SMOOTHING: usize = 3;

/// Default sampling interval (1 second).
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Monitor errors.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// A sample could not be taken.
    #[error("sampling failed: {0}")]
    Sampling(String),
}

/// Point-in-time host utilisation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourcePressure {
    /// CPU utilisation, percent of all cores.
    pub cpu_percent: f64,
    /// Memory utilisation, percent of total.
    pub memory_percent: f64,
    /// When the sample was taken.
    pub sampled_at: DateTime<Utc>,
}

impl ResourcePressure {
    /// Sample taken now.
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            cpu_percent,
            memory_percent,
            sampled_at: Utc::now(),
        }
    }

    /// Zero pressure, reported before the first sample.
    pub fn idle() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// Source of pressure samples.
pub trait PressureSampler: Send + 'static {
    /// Take one sample.
    fn sample(&mut self) -> Result<ResourcePressure, MonitorError>;
}

/// Samples the local host through `sysinfo`.
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    /// Create a sampler. CPU usage is computed between consecutive samples,
    /// so the first reading may be zero.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl PressureSampler for SysinfoSampler {
    fn sample(&mut self) -> Result<ResourcePressure, MonitorError> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        if total == 0 {
            return Err(MonitorError::Sampling("total memory reported as zero".into()));
        }
        let memory_percent = self.system.used_memory() as f64 / total as f64 * 100.0;
        let cpu_percent = f64::from(self.system.global_cpu_usage());

        Ok(ResourcePressure::new(
            cpu_percent.clamp(0.0, 100.0),
            memory_percent.clamp(0.0, 100.0),
        ))
    }
}

/// Aggregate statistics over the monitor's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MonitorSummary {
    /// Samples recorded.
    pub samples: u64,
    /// Sampling failures.
    pub failures: u64,
    /// Mean CPU percent over all samples.
    pub mean_cpu: f64,
    /// Mean memory percent over all samples.
    pub mean_memory: f64,
    /// Highest CPU percent seen.
    pub peak_cpu: f64,
    /// Highest memory percent seen.
    pub peak_memory: f64,
}

#[derive(Debug, Default)]
struct MonitorState {
    window: VecDeque<ResourcePressure>,
    samples: u64,
    failures: u64,
    cpu_sum: f64,
    memory_sum: f64,
    peak_cpu: f64,
    peak_memory: f64,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    window: usize,
    smoothing: usize,
    state: Mutex<MonitorState>,
    tx: watch::Sender<ResourcePressure>,
}

impl Shared {
    fn record(&self, sample: ResourcePressure) {
        let smoothed = {
            let mut state = lock(&self.state);
            if state.window.len() == self.window {
                state.window.pop_front();
            }
            state.window.push_back(sample);
            state.samples += 1;
            state.cpu_sum += sample.cpu_percent;
            state.memory_sum += sample.memory_percent;
            state.peak_cpu = state.peak_cpu.max(sample.cpu_percent);
            state.peak_memory = state.peak_memory.max(sample.memory_percent);

            let recent: Vec<_> = state.window.iter().rev().take(self.smoothing).collect();
            let n = recent.len() as f64;
            ResourcePressure {
                cpu_percent: recent.iter().map(|s| s.cpu_percent).sum::<f64>() / n,
                memory_percent: recent.iter().map(|s| s.memory_percent).sum::<f64>() / n,
                sampled_at: sample.sampled_at,
            }
        };
        self.tx.send_replace(smoothed);
    }

    fn record_failure(&self, err: &MonitorError) {
        let failures = {
            let mut state = lock(&self.state);
            state.failures += 1;
            state.failures
        };
        tracing::warn!(error = %err, failures, "Resource sample failed, keeping last value");
    }

    fn summary(&self) -> MonitorSummary {
        let state = lock(&self.state);
        let n = state.samples.max(1) as f64;
        MonitorSummary {
            samples: state.samples,
            failures: state.failures,
            mean_cpu: state.cpu_sum / n,
            mean_memory: state.memory_sum / n,
            peak_cpu: state.peak_cpu,
            peak_memory: state.peak_memory,
        }
    }
}

/// Periodic host pressure sampler with a smoothed, lock-free read path.
pub struct ResourceMonitor {
    shared: Arc<Shared>,
    rx: watch::Receiver<ResourcePressure>,
    sampler: Arc<Mutex<Box<dyn PressureSampler>>>,
    running: Mutex<Option<Running>>,
}

impl ResourceMonitor {
    /// Monitor sampling the local host with default window and smoothing.
    pub fn new() -> Self {
        Self::with_sampler(Box::new(SysinfoSampler::new()))
    }

    /// Monitor with a custom sampler.
    pub fn with_sampler(sampler: Box<dyn PressureSampler>) -> Self {
        Self::with_window(sampler, DEFAULT_WINDOW, DEFAULT_SMOOTHING)
    }

    /// Monitor with a custom sampler, window size, and smoothing depth.
    ///
    /// Both sizes are clamped to at least 1 and smoothing to at most the window.
    pub fn with_window(sampler: Box<dyn PressureSampler>, window: usize, smoothing: usize) -> Self {
        let window = window.max(1);
        let (tx, rx) = watch::channel(ResourcePressure::idle());
        Self {
            shared: Arc::new(Shared {
                window,
                smoothing: smoothing.clamp(1, window),
                state: Mutex::new(MonitorState::default()),
                tx,
            }),
            rx,
            sampler: Arc::new(Mutex::new(sampler)),
            running: Mutex::new(None),
        }
    }

    /// Start sampling every `every`. No-op when already running.
    pub fn start(&self, every: Duration) {
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shared = Arc::clone(&self.shared);
        let sampler = Arc::clone(&self.sampler);
        let every = every.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let sample = lock(&sampler).sample();
                match sample {
                    Ok(sample) => shared.record(sample),
                    Err(e) => shared.record_failure(&e),
                }
            }
        });

        tracing::debug!(interval_ms = every.as_millis() as u64, "Resource monitor started");
        *running = Some(Running { cancel, handle });
    }

    /// Stop sampling and return lifetime statistics. Safe to call repeatedly.
    pub async fn stop(&self) -> MonitorSummary {
        let running = lock(&self.running).take();
        if let Some(Running { cancel, handle }) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Resource monitor task ended abnormally");
            }
            tracing::debug!("Resource monitor stopped");
        }
        self.shared.summary()
    }

    /// True while the sampling task runs.
    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Smoothed pressure; idle before the first sample.
    pub fn current_pressure(&self) -> ResourcePressure {
        *self.rx.borrow()
    }

    /// Receiver notified on every new smoothed value.
    pub fn subscribe(&self) -> watch::Receiver<ResourcePressure> {
        self.rx.clone()
    }

    /// Feed a sample directly, bypassing the sampler.
    pub fn record(&self, sample: ResourcePressure) {
        self.shared.record(sample);
    }

    /// Raw samples in the window, oldest first.
    pub fn window(&self) -> Vec<ResourcePressure> {
        lock(&self.shared.state).window.iter().copied().collect()
    }

    /// Statistics so far.
    pub fn summary(&self) -> MonitorSummary {
        self.shared.summary()
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("window", &self.shared.window)
            .field("smoothing", &self.shared.smoothing)
            .field("current", &self.current_pressure())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed script, failing on `None` entries.
    struct ScriptedSampler {
        script: Vec<Option<(f64, f64)>>,
        next: usize,
    }

    impl ScriptedSampler {
        fn new(script: Vec<Option<(f64, f64)>>) -> Box<Self> {
            Box::new(Self { script, next: 0 })
        }
    }

    impl PressureSampler for ScriptedSampler {
        fn sample(&mut self) -> Result<ResourcePressure, MonitorError> {
            let entry = self.script[self.next % self.script.len()];
            self.next += 1;
            entry
                .map(|(cpu, mem)| ResourcePressure::new(cpu, mem))
                .ok_or_else(|| MonitorError::Sampling("scripted failure".into()))
        }
    }

    #[test]
    fn test_smoothing_is_mean_of_recent_samples() {
        let monitor = ResourceMonitor::with_sampler(ScriptedSampler::new(vec![None]));
        assert_eq!(monitor.current_pressure().cpu_percent, 0.0);

        for cpu in [10.0, 20.0, 30.0, 90.0] {
            monitor.record(ResourcePressure::new(cpu, 50.0));
        }
        let p = monitor.current_pressure();
        assert!((p.cpu_percent - 140.0 / 3.0).abs() < 1e-9);
        assert!((p.memory_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_is_bounded() {
        let monitor = ResourceMonitor::with_window(ScriptedSampler::new(vec![None]), 5, 2);
        for i in 0..12 {
            monitor.record(ResourcePressure::new(i as f64, 0.0));
        }
        let window = monitor.window();
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].cpu_percent, 7.0);

        let summary = monitor.summary();
        assert_eq!(summary.samples, 12);
        assert_eq!(summary.peak_cpu, 11.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampling_failure_keeps_last_value() {
        let monitor = ResourceMonitor::with_sampler(ScriptedSampler::new(vec![
            Some((40.0, 60.0)),
            None,
            None,
        ]));
        monitor.start(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(250)).await;

        let p = monitor.current_pressure();
        assert_eq!(p.cpu_percent, 40.0);
        assert_eq!(p.memory_percent, 60.0);

        let summary = monitor.stop().await;
        assert_eq!(summary.samples, 1);
        assert_eq!(summary.failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_idempotent() {
        let monitor = ResourceMonitor::with_sampler(ScriptedSampler::new(vec![Some((1.0, 1.0))]));
        monitor.start(Duration::from_millis(10));
        monitor.start(Duration::from_millis(10));
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(35)).await;
        let first = monitor.stop().await;
        let second = monitor.stop().await;
        assert!(!monitor.is_running());
        assert_eq!(first.samples, second.samples);
        assert!(first.samples >= 3);
    }

    #[test]
    fn test_sysinfo_sampler_reports_percentages() {
        let mut sampler = SysinfoSampler::new();
        if let Ok(p) = sampler.sample() {
            assert!((0.0..=100.0).contains(&p.cpu_percent));
            assert!((0.0..=100.0).contains(&p.memory_percent));
        }
    }
}
