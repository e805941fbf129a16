//! Error Aggregator
//!
//! Tallies failed and degraded task results across a run for operator-facing
//! summaries. Classification happens once, when the worker pool builds the
//! failure outcome; the aggregator only counts.
//!
//! - [`ErrorClass`]: failure taxonomy and deterministic classification
//! - [`ErrorAggregator`]: thread-safe tally, fed by the worker pool
//! - [`top_issues`]: pure ranking over the accumulated counts

mod classify;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::Serialize;

use crate::model::{TaskOutcome, TaskResult};
use crate::sync::lock;

pub use classify::{Classify, ErrorClass};

/// Maximum number of entries returned in [`ErrorSnapshot::top_issues`].
pub const TOP_ISSUES_LIMIT: usize = 10;

/// One (collector, class) failure bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    /// Collector that failed.
    pub collector: String,
    /// Failure class.
    pub class: ErrorClass,
    /// Number of failures in this bucket.
    pub count: u64,
    /// Collector declared itself critical; escalated to the top of the list.
    pub escalated: bool,
}

/// Per-collector failure counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectorCounts {
    /// Failures by class.
    pub failures: BTreeMap<ErrorClass, u64>,
    /// Partial successes.
    pub partial: u64,
    /// Collector declared itself critical.
    pub critical: bool,
}

impl CollectorCounts {
    /// Total failures across classes.
    pub fn total_failures(&self) -> u64 {
        self.failures.values().sum()
    }
}

/// Point-in-time view of the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorSnapshot {
    /// Failures by class across all collectors.
    pub counts_by_class: BTreeMap<ErrorClass, u64>,
    /// Failures and partials by collector.
    pub counts_by_collector: BTreeMap<String, CollectorCounts>,
    /// Targets with at least one failed or degraded task.
    pub affected_targets: BTreeSet<String>,
    /// Total partial successes.
    pub partial_count: u64,
    /// Ranked failure buckets, see [`top_issues`].
    pub top_issues: Vec<Issue>,
}

impl ErrorSnapshot {
    /// Total failures across classes.
    pub fn total_failures(&self) -> u64 {
        self.counts_by_class.values().sum()
    }
}

/// Thread-safe failure tally.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    inner: Mutex<ErrorSnapshot>,
}

impl ErrorAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal result. Successes are ignored.
    pub fn record(&self, result: &TaskResult) {
        let mut tally = lock(&self.inner);
        match &result.outcome {
            TaskOutcome::Success { .. } => return,
            TaskOutcome::PartialSuccess { .. } => {
                tally.partial_count += 1;
                let entry = tally
                    .counts_by_collector
                    .entry(result.collector.clone())
                    .or_default();
                entry.partial += 1;
                entry.critical |= result.critical;
            }
            TaskOutcome::Failure { class, .. } => {
                *tally.counts_by_class.entry(*class).or_default() += 1;
                let entry = tally
                    .counts_by_collector
                    .entry(result.collector.clone())
                    .or_default();
                *entry.failures.entry(*class).or_default() += 1;
                entry.critical |= result.critical;
            }
        }
        tally.affected_targets.insert(result.target.id().to_owned());
    }

    /// Copy of the current counts with `top_issues` computed from them.
    pub fn snapshot(&self) -> ErrorSnapshot {
        let mut snapshot = lock(&self.inner).clone();
        snapshot.top_issues = top_issues(&snapshot.counts_by_collector, TOP_ISSUES_LIMIT);
        snapshot
    }
}

/// Rank failure buckets for operators.
///
/// Order: critical collectors first, then class severity, then frequency,
/// then collector name and class for a stable tie-break.
pub fn top_issues(counts: &BTreeMap<String, CollectorCounts>, limit: usize) -> Vec<Issue> {
    let mut issues: Vec<Issue> = counts
        .iter()
        .flat_map(|(collector, c)| {
            c.failures.iter().map(move |(class, count)| Issue {
                collector: collector.clone(),
                class: *class,
                count: *count,
                escalated: c.critical,
            })
        })
        .collect();

    issues.sort_by(|a, b| {
        b.escalated
            .cmp(&a.escalated)
            .then_with(|| b.class.severity().cmp(&a.class.severity()))
            .then_with(|| b.count.cmp(&a.count))
            .then_with(|| a.collector.cmp(&b.collector))
            .then_with(|| a.class.cmp(&b.class))
    });
    issues.truncate(limit);
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskId, Target};
    use chrono::Utc;
    use std::time::Duration;

    fn result(target: &str, collector: &str, critical: bool, outcome: TaskOutcome) -> TaskResult {
        let t = Target::new(target);
        TaskResult {
            task_id: TaskId::new(1, &t, collector),
            target: t,
            collector: collector.to_string(),
            critical,
            batch: 1,
            attempts: 1,
            outcome,
            finished_at: Utc::now(),
        }
    }

    fn failure(class: ErrorClass) -> TaskOutcome {
        TaskOutcome::Failure {
            class,
            message: "boom".to_string(),
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_record_counts() {
        let agg = ErrorAggregator::new();
        agg.record(&result(
            "a",
            "tcp",
            false,
            TaskOutcome::Success {
                payload: serde_json::json!({}),
                elapsed: Duration::ZERO,
            },
        ));
        agg.record(&result("a", "tcp", false, failure(ErrorClass::Timeout)));
        agg.record(&result("b", "tcp", false, failure(ErrorClass::Timeout)));
        agg.record(&result("b", "pkgs", false, failure(ErrorClass::Authentication)));
        agg.record(&result(
            "c",
            "pkgs",
            false,
            TaskOutcome::PartialSuccess {
                payload: serde_json::json!({}),
                degraded_reason: "fallback".to_string(),
                elapsed: Duration::ZERO,
            },
        ));

        let snap = agg.snapshot();
        assert_eq!(snap.total_failures(), 3);
        assert_eq!(snap.counts_by_class[&ErrorClass::Timeout], 2);
        assert_eq!(snap.counts_by_collector["tcp"].total_failures(), 2);
        assert_eq!(snap.counts_by_collector["pkgs"].partial, 1);
        assert_eq!(snap.partial_count, 1);
        assert_eq!(
            snap.affected_targets.iter().cloned().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_top_issues_ordering() {
        let agg = ErrorAggregator::new();
        for _ in 0..5 {
            agg.record(&result("a", "tcp", false, failure(ErrorClass::Timeout)));
        }
        agg.record(&result("a", "pkgs", false, failure(ErrorClass::Authentication)));
        agg.record(&result("a", "kernel", true, failure(ErrorClass::Timeout)));

        let issues = agg.snapshot().top_issues;
        assert_eq!(issues.len(), 3);
        // Critical collector escalates regardless of class or count.
        assert_eq!(issues[0].collector, "kernel");
        assert!(issues[0].escalated);
        // Then severity beats frequency.
        assert_eq!(issues[1].class, ErrorClass::Authentication);
        assert_eq!(issues[2].count, 5);
    }

    #[test]
    fn test_top_issues_is_pure() {
        let mut counts = BTreeMap::new();
        let mut c = CollectorCounts::default();
        c.failures.insert(ErrorClass::Connectivity, 3);
        c.failures.insert(ErrorClass::NameResolution, 3);
        counts.insert("tcp".to_string(), c);

        let first = top_issues(&counts, 10);
        let second = top_issues(&counts, 10);
        assert_eq!(first, second);
        assert_eq!(first[0].class, ErrorClass::NameResolution);
        assert_eq!(top_issues(&counts, 1).len(), 1);
    }
}
