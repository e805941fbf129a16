//! Pressure-driven concurrency control.
//!
//! Decrease is immediate and multiplicative (halve, floor 1); increase is
//! gradual and additive, and only after pressure has stayed low for a whole
//! recovery window. At concurrency 1 with pressure at the critical level the
//! controller asks the scheduler to pause admission.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tokio::time::Instant;

use crate::monitor::ResourcePressure;

fn default_cpu_high() -> f64 {
    85.0
}

fn default_memory_high() -> f64 {
    90.0
}

fn default_cpu_low() -> f64 {
    60.0
}

fn default_memory_low() -> f64 {
    75.0
}

fn default_cpu_critical() -> f64 {
    97.0
}

fn default_memory_critical() -> f64 {
    97.0
}

fn default_recovery_window() -> Duration {
    Duration::from_secs(10)
}

fn default_recovery_step() -> usize {
    2
}

fn default_base_backoff() -> Duration {
    Duration::from_millis(250)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_max_pause() -> Duration {
    Duration::from_secs(300)
}

fn default_pause_poll() -> Duration {
    Duration::from_secs(1)
}

/// Thresholds and pacing for the throttle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// CPU percent at or above which concurrency is halved (default: 85).
    #[serde(default = "default_cpu_high")]
    pub cpu_high: f64,
    /// Memory percent at or above which concurrency is halved (default: 90).
    #[serde(default = "default_memory_high")]
    pub memory_high: f64,
    /// CPU percent below which pressure counts as low (default: 60).
    #[serde(default = "default_cpu_low")]
    pub cpu_low: f64,
    /// Memory percent below which pressure counts as low (default: 75).
    #[serde(default = "default_memory_low")]
    pub memory_low: f64,
    /// CPU percent that pauses a run already at concurrency 1 (default: 97).
    #[serde(default = "default_cpu_critical")]
    pub cpu_critical: f64,
    /// Memory percent that pauses a run already at concurrency 1 (default: 97).
    #[serde(default = "default_memory_critical")]
    pub memory_critical: f64,
    /// Continuous low pressure needed before each increase (default: 10s).
    #[serde(default = "default_recovery_window", with = "humantime_serde")]
    pub recovery_window: Duration,
    /// Concurrency added per recovery step (default: 2).
    #[serde(default = "default_recovery_step")]
    pub recovery_step: usize,
    /// First admission backoff after a breach (default: 250ms).
    #[serde(default = "default_base_backoff", with = "humantime_serde")]
    pub base_backoff: Duration,
    /// Admission backoff cap (default: 10s).
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Longest a run may stay paused before giving up (default: 5m).
    #[serde(default = "default_max_pause", with = "humantime_serde")]
    pub max_pause: Duration,
    /// How often pressure is re-read while paused (default: 1s).
    #[serde(default = "default_pause_poll", with = "humantime_serde")]
    pub pause_poll: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cpu_high: default_cpu_high(),
            memory_high: default_memory_high(),
            cpu_low: default_cpu_low(),
            memory_low: default_memory_low(),
            cpu_critical: default_cpu_critical(),
            memory_critical: default_memory_critical(),
            recovery_window: default_recovery_window(),
            recovery_step: default_recovery_step(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
            max_pause: default_max_pause(),
            pause_poll: default_pause_poll(),
        }
    }
}

impl ThrottleConfig {
    fn is_high(&self, p: &ResourcePressure) -> bool {
        p.cpu_percent >= self.cpu_high || p.memory_percent >= self.memory_high
    }

    fn is_low(&self, p: &ResourcePressure) -> bool {
        p.cpu_percent < self.cpu_low && p.memory_percent < self.memory_low
    }

    fn is_critical(&self, p: &ResourcePressure) -> bool {
        p.cpu_percent >= self.cpu_critical || p.memory_percent >= self.memory_critical
    }
}

/// What the controller decided for one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    /// Nothing changed.
    Hold,
    /// Concurrency was lowered (or backoff grew at the floor).
    Decrease,
    /// Concurrency was raised by one recovery step.
    Increase,
    /// Critical pressure at the floor; stop admitting.
    Pause,
}

/// Result of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleAction {
    pub decision: Decision,
    /// Concurrency limit to apply.
    pub concurrency: usize,
    /// Delay before the next admission.
    pub backoff: Duration,
    /// Sink should run in constrained mode.
    pub constrained: bool,
}

/// AIMD concurrency controller.
#[derive(Debug, Clone)]
pub struct ThrottleController {
    config: ThrottleConfig,
    max_concurrency: usize,
    concurrency: usize,
    backoff: Duration,
    low_since: Option<Instant>,
    constrained: bool,
    decreases: u64,
    increases: u64,
}

impl ThrottleController {
    /// Controller starting at `max_concurrency` (minimum 1).
    pub fn new(config: ThrottleConfig, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            config,
            max_concurrency,
            concurrency: max_concurrency,
            backoff: Duration::ZERO,
            low_since: None,
            constrained: false,
            decreases: 0,
            increases: 0,
        }
    }

    /// Current concurrency.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Configured ceiling.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Current admission backoff.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Number of decreases so far.
    pub fn decreases(&self) -> u64 {
        self.decreases
    }

    /// Number of increases so far.
    pub fn increases(&self) -> u64 {
        self.increases
    }

    /// Thresholds in use.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Feed one smoothed pressure reading taken at `now`.
    pub fn observe(&mut self, pressure: &ResourcePressure, now: Instant) -> ThrottleAction {
        let decision = if self.concurrency == 1 && self.config.is_critical(pressure) {
            self.low_since = None;
            self.constrained = true;
            Decision::Pause
        } else if self.config.is_high(pressure) {
            self.low_since = None;
            self.concurrency = (self.concurrency / 2).max(1);
            self.backoff = (self.backoff * 2)
                .max(self.config.base_backoff)
                .min(self.config.max_backoff);
            self.constrained = true;
            self.decreases += 1;
            Decision::Decrease
        } else if self.config.is_low(pressure) {
            let since = *self.low_since.get_or_insert(now);
            if self.concurrency < self.max_concurrency
                && now.duration_since(since) >= self.config.recovery_window
            {
                self.concurrency =
                    (self.concurrency + self.config.recovery_step.max(1)).min(self.max_concurrency);
                self.low_since = Some(now);
                self.backoff = Duration::ZERO;
                self.increases += 1;
                if self.concurrency == self.max_concurrency {
                    self.constrained = false;
                }
                Decision::Increase
            } else {
                if self.concurrency == self.max_concurrency {
                    self.backoff = Duration::ZERO;
                    self.constrained = false;
                }
                Decision::Hold
            }
        } else {
            self.low_since = None;
            Decision::Hold
        };

        ThrottleAction {
            decision,
            concurrency: self.concurrency,
            backoff: self.backoff,
            constrained: self.constrained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pressure(cpu: f64, memory: f64) -> ResourcePressure {
        ResourcePressure::new(cpu, memory)
    }

    fn config() -> ThrottleConfig {
        ThrottleConfig {
            recovery_window: Duration::from_secs(5),
            recovery_step: 2,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            ..ThrottleConfig::default()
        }
    }

    #[test]
    fn test_high_pressure_halves_with_floor() {
        let mut t = ThrottleController::new(config(), 16);
        let now = Instant::now();
        let seen: Vec<_> = (0..6)
            .map(|_| t.observe(&pressure(90.0, 10.0), now).concurrency)
            .collect();
        assert_eq!(seen, vec![8, 4, 2, 1, 1, 1]);
        assert_eq!(t.decreases(), 6);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut t = ThrottleController::new(config(), 64);
        let now = Instant::now();
        let backoffs: Vec<_> = (0..6)
            .map(|_| t.observe(&pressure(10.0, 95.0), now).backoff.as_millis())
            .collect();
        assert_eq!(backoffs, vec![100, 200, 400, 800, 800, 800]);
    }

    #[test]
    fn test_recovery_needs_full_window() {
        let mut t = ThrottleController::new(config(), 8);
        let start = Instant::now();
        t.observe(&pressure(90.0, 10.0), start);
        assert_eq!(t.concurrency(), 4);

        let low = pressure(10.0, 10.0);
        let a = t.observe(&low, start + Duration::from_secs(1));
        assert_eq!(a.decision, Decision::Hold);
        let a = t.observe(&low, start + Duration::from_secs(4));
        assert_eq!(a.decision, Decision::Hold);
        let a = t.observe(&low, start + Duration::from_secs(6));
        assert_eq!(a.decision, Decision::Increase);
        assert_eq!(a.concurrency, 6);
        assert_eq!(a.backoff, Duration::ZERO);
        assert!(a.constrained);

        // Window restarts after each step.
        let a = t.observe(&low, start + Duration::from_secs(7));
        assert_eq!(a.decision, Decision::Hold);
        let a = t.observe(&low, start + Duration::from_secs(11));
        assert_eq!(a.concurrency, 8);
        assert!(!a.constrained);
    }

    #[test]
    fn test_mid_pressure_resets_recovery_window() {
        let mut t = ThrottleController::new(config(), 8);
        let start = Instant::now();
        t.observe(&pressure(90.0, 10.0), start);

        t.observe(&pressure(10.0, 10.0), start + Duration::from_secs(1));
        t.observe(&pressure(70.0, 10.0), start + Duration::from_secs(3));
        let a = t.observe(&pressure(10.0, 10.0), start + Duration::from_secs(7));
        assert_eq!(a.decision, Decision::Hold);
        assert_eq!(a.concurrency, 4);
    }

    #[test]
    fn test_pause_only_at_floor_and_critical() {
        let mut t = ThrottleController::new(config(), 2);
        let now = Instant::now();
        let critical = pressure(99.0, 10.0);

        assert_eq!(t.observe(&critical, now).decision, Decision::Decrease);
        assert_eq!(t.concurrency(), 1);
        assert_eq!(t.observe(&critical, now).decision, Decision::Pause);
        // High but not critical at the floor keeps decreasing (backoff grows).
        assert_eq!(
            t.observe(&pressure(90.0, 10.0), now).decision,
            Decision::Decrease
        );
    }

    proptest! {
        #[test]
        fn prop_concurrency_stays_in_bounds(
            max in 1usize..64,
            readings in prop::collection::vec((0.0f64..100.0, 0.0f64..100.0), 1..200),
        ) {
            let mut t = ThrottleController::new(config(), max);
            let start = Instant::now();
            for (i, (cpu, mem)) in readings.into_iter().enumerate() {
                let before = t.concurrency();
                let a = t.observe(&pressure(cpu, mem), start + Duration::from_secs(i as u64));
                prop_assert!(a.concurrency >= 1 && a.concurrency <= max);
                prop_assert!(a.backoff <= config().max_backoff);
                match a.decision {
                    Decision::Decrease => prop_assert!(a.concurrency == (before / 2).max(1)),
                    Decision::Increase => prop_assert!(a.concurrency > before && a.concurrency <= before + 2),
                    Decision::Hold | Decision::Pause => prop_assert_eq!(a.concurrency, before),
                }
            }
        }
    }
}
