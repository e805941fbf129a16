//! Core data model shared by every orchestration component.
//!
//! - [`Target`]: one remote machine to audit (immutable once enqueued)
//! - [`CollectorTask`]: a target paired with a collector, deadline, and retry policy
//! - [`TaskResult`] / [`TaskOutcome`]: the single terminal result of a task
//! - [`Batch`]: an ordered slice of the target list with a 1-based index

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::aggregate::ErrorClass;
use crate::collector::Collector;
use crate::retry::RetryPolicy;

/// 1-based position of a batch within a run. `0` means "no batch".
pub type BatchIndex = u64;

// =============================================================================
// Target
// =============================================================================

/// A remote machine to audit.
///
/// Identity (equality, hashing, checkpoint membership) is the identifier alone;
/// the credential reference is opaque to the core and only handed to collectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    credential: Option<String>,
}

impl Target {
    /// Create a target from a hostname, address, or `host:port`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            credential: None,
        }
    }

    /// Attach a credential reference (e.g. a vault key name).
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// The target identifier as supplied.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Optional credential reference.
    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    /// Host portion of the identifier, without any `:port` suffix.
    ///
    /// Bracketed IPv6 literals (`[::1]:22`) are unwrapped; bare IPv6 addresses
    /// are returned unchanged.
    pub fn host(&self) -> &str {
        if let Some(rest) = self.id.strip_prefix('[')
            && let Some(end) = rest.find(']')
        {
            return &rest[..end];
        }
        match self.id.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
            _ => &self.id,
        }
    }

    /// Explicit port from the identifier, if any.
    pub fn port(&self) -> Option<u16> {
        let tail = match self.id.strip_prefix('[') {
            Some(rest) => rest.split_once("]:").map(|(_, p)| p)?,
            None => {
                let (host, port) = self.id.rsplit_once(':')?;
                if host.contains(':') {
                    return None;
                }
                port
            }
        };
        tail.parse().ok()
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Target {}

impl std::hash::Hash for Target {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

// =============================================================================
// Batches
// =============================================================================

/// An ordered, immutable group of targets processed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// 1-based, monotonically increasing index.
    pub index: BatchIndex,
    /// Targets in input order.
    pub targets: Vec<Target>,
}

impl Batch {
    /// Number of targets in the batch.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when the batch holds no targets.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Split `targets` into batches of `batch_size`, preserving input order.
///
/// The last batch may be smaller. A `batch_size` of zero is treated as one.
pub fn partition(targets: &[Target], batch_size: usize) -> Vec<Batch> {
    targets
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| Batch {
            index: i as BatchIndex + 1,
            targets: chunk.to_vec(),
        })
        .collect()
}

// =============================================================================
// Tasks
// =============================================================================

/// Correlation identifier for a task.
///
/// Deterministic over (batch, target, collector) so a task re-executed after a
/// resume carries the same id as its earlier attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Build the id for `collector` running against `target` in `batch`.
    pub fn new(batch: BatchIndex, target: &Target, collector: &str) -> Self {
        Self(format!("b{batch}/{}/{collector}", target.id()))
    }

    /// String form of the id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of work: run `collector` against `target`.
#[derive(Clone)]
pub struct CollectorTask {
    /// Correlation id.
    pub id: TaskId,
    /// Batch this task belongs to.
    pub batch: BatchIndex,
    /// Machine to audit.
    pub target: Target,
    /// Collector capability.
    pub collector: Arc<dyn Collector>,
    /// Deadline for the whole task (session, retries, invocation).
    pub timeout: Duration,
    /// Retry policy applied to transient failures.
    pub retry: RetryPolicy,
}

impl CollectorTask {
    /// Create a task using the collector's declared timeout.
    pub fn new(
        batch: BatchIndex,
        target: Target,
        collector: Arc<dyn Collector>,
        retry: RetryPolicy,
    ) -> Self {
        let meta = collector.meta();
        Self {
            id: TaskId::new(batch, &target, &meta.name),
            batch,
            timeout: meta.timeout,
            target,
            collector,
            retry,
        }
    }

    /// Override the deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Collector name from its metadata.
    pub fn collector_name(&self) -> String {
        self.collector.meta().name
    }
}

impl fmt::Debug for CollectorTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorTask")
            .field("id", &self.id)
            .field("batch", &self.batch)
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Results
// =============================================================================

/// Coarse status of a terminal result.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Success,
    PartialSuccess,
    Failure,
}

/// Terminal outcome of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Collector produced its full payload.
    Success {
        payload: serde_json::Value,
        elapsed: Duration,
    },
    /// Collector produced a degraded payload via a fallback strategy.
    PartialSuccess {
        payload: serde_json::Value,
        degraded_reason: String,
        elapsed: Duration,
    },
    /// No payload; the error was classified once at creation.
    Failure {
        class: ErrorClass,
        message: String,
        elapsed: Duration,
    },
}

impl TaskOutcome {
    /// Status tag of the outcome.
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Success { .. } => TaskStatus::Success,
            Self::PartialSuccess { .. } => TaskStatus::PartialSuccess,
            Self::Failure { .. } => TaskStatus::Failure,
        }
    }

    /// Wall time spent on the task.
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Success { elapsed, .. }
            | Self::PartialSuccess { elapsed, .. }
            | Self::Failure { elapsed, .. } => *elapsed,
        }
    }
}

/// The single terminal result of a [`CollectorTask`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    /// Correlation id of the originating task.
    pub task_id: TaskId,
    /// Audited machine.
    pub target: Target,
    /// Collector name.
    pub collector: String,
    /// Whether the collector declared itself critical.
    pub critical: bool,
    /// Batch the task belonged to.
    pub batch: BatchIndex,
    /// Attempts made across all strategies.
    pub attempts: u32,
    /// What happened.
    pub outcome: TaskOutcome,
    /// Completion timestamp.
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    /// Status tag of the outcome.
    pub fn status(&self) -> TaskStatus {
        self.outcome.status()
    }

    /// Error class for failures.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match &self.outcome {
            TaskOutcome::Failure { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Success { .. })
    }

    /// True for `Failure`.
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Failure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn targets(n: usize) -> Vec<Target> {
        (0..n).map(|i| Target::new(format!("host-{i}"))).collect()
    }

    // =========================================================================
    // Target tests
    // =========================================================================

    #[test]
    fn test_target_host_and_port() {
        let t = Target::new("db01.example.com:5432");
        assert_eq!(t.host(), "db01.example.com");
        assert_eq!(t.port(), Some(5432));

        let t = Target::new("db01.example.com");
        assert_eq!(t.host(), "db01.example.com");
        assert_eq!(t.port(), None);

        let t = Target::new("[::1]:22");
        assert_eq!(t.host(), "::1");
        assert_eq!(t.port(), Some(22));

        let t = Target::new("fe80::1");
        assert_eq!(t.host(), "fe80::1");
        assert_eq!(t.port(), None);
    }

    #[test]
    fn test_target_identity_ignores_credential() {
        let a = Target::new("web01").with_credential("vault:web");
        let b = Target::new("web01");
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    // =========================================================================
    // Partition tests
    // =========================================================================

    #[test]
    fn test_partition_sizes_and_indices() {
        let batches = partition(&targets(12), 5);
        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches.iter().map(Batch::len).collect::<Vec<_>>(),
            vec![5, 5, 2]
        );
        assert_eq!(
            batches.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_partition_empty_and_zero_size() {
        assert!(partition(&[], 5).is_empty());
        assert_eq!(partition(&targets(3), 0).len(), 3);
    }

    #[test]
    fn test_task_id_is_deterministic() {
        let t = Target::new("web01");
        assert_eq!(TaskId::new(3, &t, "tcp"), TaskId::new(3, &t, "tcp"));
        assert_eq!(TaskId::new(3, &t, "tcp").as_str(), "b3/web01/tcp");
        assert_ne!(TaskId::new(3, &t, "tcp"), TaskId::new(4, &t, "tcp"));
    }

    #[test]
    fn test_task_status_strings() {
        assert_eq!(TaskStatus::PartialSuccess.as_ref(), "partial_success");
        assert_eq!(TaskStatus::Failure.to_string(), "failure");
    }
}
