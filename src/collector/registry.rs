//! Collector registry: name to implementation lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collector::{Collector, CollectorError};

/// Registry of collectors available to a run.
///
/// Iteration order is by name, so task dispatch order within a target is
/// stable across runs.
#[derive(Default, Clone)]
pub struct CollectorRegistry {
    collectors: BTreeMap<String, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector under its metadata name.
    ///
    /// # Errors
    /// Returns `CollectorError::Config` if the name is empty or taken.
    pub fn register(&mut self, collector: Arc<dyn Collector>) -> Result<(), CollectorError> {
        let name = collector.meta().name;
        if name.trim().is_empty() {
            return Err(CollectorError::Config("collector name is empty".into()));
        }
        if self.collectors.contains_key(&name) {
            return Err(CollectorError::Config(format!(
                "duplicate collector name: {name}"
            )));
        }
        tracing::debug!(collector = %name, "Collector registered");
        self.collectors.insert(name, collector);
        Ok(())
    }

    /// Look up a collector by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.get(name).cloned()
    }

    /// Registered names in order.
    pub fn names(&self) -> Vec<String> {
        self.collectors.keys().cloned().collect()
    }

    /// All collectors in name order.
    pub fn all(&self) -> Vec<Arc<dyn Collector>> {
        self.collectors.values().cloned().collect()
    }

    /// Resolve a list of names, failing on the first unknown one.
    pub fn select<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> Result<Vec<Arc<dyn Collector>>, CollectorError> {
        names
            .iter()
            .map(|n| {
                self.get(n.as_ref()).ok_or_else(|| {
                    CollectorError::Config(format!("unknown collector: {}", n.as_ref()))
                })
            })
            .collect()
    }

    /// Number of registered collectors.
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("collectors", &self.collectors.keys().collect::<Vec<_>>())
            .finish()
    }
}
