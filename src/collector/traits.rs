//! Core collector traits and types.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{Classify, ErrorClass};
use crate::model::Target;
use crate::pool::{PoolError, SessionHandle};

/// Default collector timeout (30 seconds).
pub const DEFAULT_COLLECTOR_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors a collector can report.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Network or local I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The probe's own deadline elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Session could not be established.
    #[error("session error: {0}")]
    Session(#[from] PoolError),

    /// Credentials rejected or missing.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Remote command or script failed.
    #[error("remote execution failed: {0}")]
    Remote(String),

    /// Collected data was malformed.
    #[error("invalid data: {0}")]
    Data(String),

    /// Local or remote resources ran out.
    #[error("resource exhausted: {0}")]
    Exhausted(String),

    /// Collector declared a degraded mode but has none for this call.
    #[error("no degraded mode available")]
    NoFallback,

    /// Configuration error (duplicate or unknown collector, bad settings).
    #[error("config error: {0}")]
    Config(String),

    /// Anything else; classified from the message.
    #[error("{0}")]
    Other(String),
}

impl Classify for CollectorError {
    fn error_class(&self) -> ErrorClass {
        match self {
            Self::Io(e) => ErrorClass::from_io(e),
            Self::Timeout(_) => ErrorClass::Timeout,
            Self::Session(e) => e.error_class(),
            Self::Auth(_) => ErrorClass::Authentication,
            Self::Remote(_) => ErrorClass::RemoteExecution,
            Self::Data(_) => ErrorClass::DataValidation,
            Self::Exhausted(_) => ErrorClass::ResourceExhaustion,
            Self::NoFallback | Self::Config(_) => ErrorClass::Unclassified,
            Self::Other(msg) => ErrorClass::from_message(msg),
        }
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Data(e.to_string())
    }
}

/// Metadata the core reads from a collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorMeta {
    /// Unique collector name.
    pub name: String,
    /// Declared per-task deadline.
    pub timeout: Duration,
    /// Failures of critical collectors are escalated in reports.
    pub critical: bool,
    /// Collector implements [`Collector::invoke_degraded`].
    pub degraded: bool,
}

impl CollectorMeta {
    /// Metadata with the default timeout, non-critical, no degraded mode.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: DEFAULT_COLLECTOR_TIMEOUT,
            critical: false,
            degraded: false,
        }
    }

    /// Set the declared timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mark the collector critical.
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Declare a degraded mode.
    pub fn with_degraded(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }
}

/// Per-attempt context handed to a collector.
#[derive(Debug, Clone)]
pub struct CollectContext {
    /// Machine being audited.
    pub target: Target,
    /// Leased session for the target.
    pub session: Arc<SessionHandle>,
    /// 1-based attempt number within the current strategy.
    pub attempt: u32,
    /// Fires when the task deadline expires or the run is aborted.
    pub cancel: CancellationToken,
}

/// Data collection capability.
///
/// Implementations must be cheap to share (`Arc<dyn Collector>`) and safe to
/// invoke concurrently against different targets.
///
/// # Error Handling
///
/// Return an error whose [`Classify::error_class`] reflects what went wrong;
/// transient classes (connectivity, name resolution, timeout) are retried by
/// the worker pool, everything else fails the task on the first attempt.
#[async_trait::async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Name, deadline, criticality, and degraded-mode support.
    fn meta(&self) -> CollectorMeta;

    /// Perform one full collection against `ctx.target`.
    async fn invoke(&self, ctx: &CollectContext) -> Result<serde_json::Value, CollectorError>;

    /// Perform a reduced collection after the primary path has failed.
    ///
    /// `None` means no degraded mode; a success here is reported as a
    /// partial success.
    async fn invoke_degraded(
        &self,
        _ctx: &CollectContext,
    ) -> Option<Result<serde_json::Value, CollectorError>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_collector_error_classes() {
        let cases = [
            (
                CollectorError::Io(std::io::Error::from(ErrorKind::ConnectionRefused)),
                ErrorClass::Connectivity,
            ),
            (
                CollectorError::Timeout(Duration::from_secs(1)),
                ErrorClass::Timeout,
            ),
            (
                CollectorError::Auth("bad key".into()),
                ErrorClass::Authentication,
            ),
            (
                CollectorError::Remote("exit 2".into()),
                ErrorClass::RemoteExecution,
            ),
            (
                CollectorError::Data("truncated".into()),
                ErrorClass::DataValidation,
            ),
            (
                CollectorError::Other("no route to host".into()),
                ErrorClass::Connectivity,
            ),
            (CollectorError::NoFallback, ErrorClass::Unclassified),
        ];
        for (err, expected) in cases {
            assert_eq!(err.error_class(), expected, "{err}");
        }
    }

    #[test]
    fn test_meta_builder() {
        let meta = CollectorMeta::new("pkgs")
            .with_timeout(Duration::from_secs(5))
            .with_critical(true);
        assert_eq!(meta.name, "pkgs");
        assert_eq!(meta.timeout, Duration::from_secs(5));
        assert!(meta.critical);
        assert!(!meta.degraded);
    }
}
