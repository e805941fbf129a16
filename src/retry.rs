//! Retry Executor
//!
//! Wraps a unit of work with bounded retries and backoff. Only transient
//! error classes (see [`ErrorClass::is_transient`]) are retried; everything
//! else short-circuits on the first failure.
//!
//! Fallbacks ("try A, then B") are expressed as a [`StrategyChain`]: an
//! ordered list of strategies sharing one `attempt(n) -> Result` contract.
//! The executor runs each strategy under the retry policy and falls through
//! to the next on failure.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{Classify, ErrorClass};

// =============================================================================
// Constants
// =============================================================================

/// Default maximum attempts per strategy.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base backoff delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);

/// Default backoff cap.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Exponent cap to keep `2^n` from overflowing.
const MAX_EXPONENT: u32 = 20;

// =============================================================================
// Policy
// =============================================================================

/// How the delay grows between attempts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackoffStrategy {
    /// `base * 2^(n-1)` after the n-th failure.
    #[default]
    Exponential,
    /// `base * n` after the n-th failure.
    Linear,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

/// Retry policy for a single strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first (default: 3, minimum: 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay (default: 200ms).
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    /// Delay cap (default: 10s).
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth strategy (default: exponential).
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter ratio in `[0, 1]`; the delay is scaled by a uniform factor in
    /// `[1 - jitter, 1 + jitter]` (default: 0, no jitter).
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the maximum attempts (clamped to at least 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set base and cap delays.
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Set the growth strategy.
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the jitter ratio (clamped to `[0, 1]`).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay after the `failures`-th failed attempt (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let n = failures.max(1);
        let raw = match self.backoff {
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(1u32 << (n - 1).min(MAX_EXPONENT)),
            BackoffStrategy::Linear => self.base_delay.saturating_mul(n),
        };
        raw.min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let ratio = self.jitter.min(1.0);
        let factor = rand::rng().random_range((1.0 - ratio)..=(1.0 + ratio));
        delay.mul_f64(factor.max(0.0))
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { last: E, attempts: u32 },

    /// A non-transient error stopped retrying immediately.
    #[error("terminal failure after {attempts} attempt(s): {last}")]
    Terminal { last: E, attempts: u32 },

    /// The cancellation token fired.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { last: Option<E>, attempts: u32 },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Terminal { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The last error observed, if any attempt completed.
    pub fn last(&self) -> Option<&E> {
        match self {
            Self::Exhausted { last, .. } | Self::Terminal { last, .. } => Some(last),
            Self::Cancelled { last, .. } => last.as_ref(),
        }
    }

    /// True when the run or task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    fn with_attempts(self, total: u32) -> Self {
        match self {
            Self::Exhausted { last, .. } => Self::Exhausted {
                last,
                attempts: total,
            },
            Self::Terminal { last, .. } => Self::Terminal {
                last,
                attempts: total,
            },
            Self::Cancelled { last, .. } => Self::Cancelled {
                last,
                attempts: total,
            },
        }
    }
}

impl<E: Classify> RetryError<E> {
    /// Class of the last error; `Unclassified` when nothing completed.
    pub fn error_class(&self) -> ErrorClass {
        self.last()
            .map(Classify::error_class)
            .unwrap_or(ErrorClass::Unclassified)
    }
}

/// A successful value and how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    /// The value.
    pub value: T,
    /// Attempts made across all strategies.
    pub attempts: u32,
    /// Name of the strategy that succeeded.
    pub strategy: String,
    /// Position of that strategy in the chain (0 = primary).
    pub position: usize,
    /// Display form of the errors that made earlier strategies fall through.
    pub fell_back_from: Vec<String>,
}

impl<T> Attempted<T> {
    /// True when a fallback strategy produced the value.
    pub fn is_fallback(&self) -> bool {
        self.position > 0
    }
}

// =============================================================================
// Strategies
// =============================================================================

type AttemptFn<'a, T, E> = Box<dyn FnMut(u32) -> BoxFuture<'a, Result<T, E>> + Send + 'a>;

/// One way of producing a value. Called with the 1-based attempt number.
pub struct Strategy<'a, T, E> {
    name: String,
    attempt: AttemptFn<'a, T, E>,
}

impl<'a, T, E> Strategy<'a, T, E> {
    /// Create a named strategy.
    pub fn new<F>(name: impl Into<String>, attempt: F) -> Self
    where
        F: FnMut(u32) -> BoxFuture<'a, Result<T, E>> + Send + 'a,
    {
        Self {
            name: name.into(),
            attempt: Box::new(attempt),
        }
    }

    /// Strategy name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T, E> fmt::Debug for Strategy<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Ordered fallback list evaluated by [`RetryExecutor::execute_chain`].
#[derive(Debug)]
pub struct StrategyChain<'a, T, E> {
    strategies: Vec<Strategy<'a, T, E>>,
}

impl<'a, T, E> StrategyChain<'a, T, E> {
    /// Chain starting with `primary`.
    pub fn new(primary: Strategy<'a, T, E>) -> Self {
        Self {
            strategies: vec![primary],
        }
    }

    /// Append a fallback.
    #[must_use]
    pub fn then(mut self, fallback: Strategy<'a, T, E>) -> Self {
        self.strategies.push(fallback);
        self
    }

    /// Number of strategies.
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Always false; a chain holds at least its primary.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Runs operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Both the operation and the
    /// backoff sleep are abandoned as soon as `cancel` fires.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last: Option<E> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    last,
                    attempts: attempt - 1,
                });
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { last, attempts: attempt });
                }
                r = op(attempt) => r,
            };

            let err = match result {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => e,
            };

            let class = err.error_class();
            if !class.is_transient() {
                tracing::debug!(attempt, class = %class, error = %err, "Terminal failure, not retrying");
                return Err(RetryError::Terminal {
                    last: err,
                    attempts: attempt,
                });
            }
            if attempt == max_attempts {
                tracing::debug!(attempt, class = %class, error = %err, "Retry attempts exhausted");
                return Err(RetryError::Exhausted {
                    last: err,
                    attempts: attempt,
                });
            }

            let delay = self.policy.jittered(self.policy.delay_for(attempt));
            tracing::debug!(attempt, class = %class, delay_ms = delay.as_millis() as u64, error = %err, "Transient failure, backing off");
            last = Some(err);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { last, attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // max_attempts >= 1 guarantees the loop returned.
        Err(RetryError::Cancelled {
            last,
            attempts: max_attempts,
        })
    }

    /// Evaluate a chain in order, retrying each strategy under the policy.
    ///
    /// A strategy that fails (terminally or by exhaustion) hands over to the
    /// next one. The error of the last strategy is returned when all fail,
    /// carrying the total attempt count. Cancellation stops the chain.
    pub async fn execute_chain<T, E>(
        &self,
        cancel: &CancellationToken,
        chain: StrategyChain<'_, T, E>,
    ) -> Result<Attempted<T>, RetryError<E>>
    where
        E: Classify + fmt::Display,
    {
        let mut total = 0u32;
        let mut fell_back_from = Vec::new();
        let count = chain.strategies.len();

        for (position, mut strategy) in chain.strategies.into_iter().enumerate() {
            let name = strategy.name.clone();
            match self.execute(cancel, |n| (strategy.attempt)(n)).await {
                Ok((value, attempts)) => {
                    return Ok(Attempted {
                        value,
                        attempts: total + attempts,
                        strategy: name,
                        position,
                        fell_back_from,
                    });
                }
                Err(err) => {
                    total += err.attempts();
                    if err.is_cancelled() || position + 1 == count {
                        return Err(err.with_attempts(total));
                    }
                    tracing::debug!(strategy = %name, error = %err, "Strategy failed, falling back");
                    fell_back_from.push(match err.last() {
                        Some(last) => format!("{name}: {last}"),
                        None => format!("{name}: {err}"),
                    });
                }
            }
        }

        Err(RetryError::Cancelled {
            last: None,
            attempts: total,
        })
    }
}
