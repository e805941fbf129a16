//! Collector configuration structures.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collector::CollectorRegistry;
use crate::collector::tcp::{TcpCollector, TcpConfig};

use super::validation::ConfigError;

/// Collectors configuration grouped by type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorsConfig {
    /// TCP port probe collectors.
    #[serde(default)]
    pub tcp: Vec<TcpConfig>,
}

impl CollectorsConfig {
    /// Merge another CollectorsConfig into this one.
    #[must_use]
    pub fn merge(mut self, other: CollectorsConfig) -> Self {
        self.tcp.extend(other.tcp);
        self
    }

    /// Validate all collector configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_names = HashSet::new();

        for tcp in &self.tcp {
            if tcp.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "tcp collector name cannot be empty".to_string(),
                ));
            }
            if !seen_names.insert(&tcp.name) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate collector name: '{}'",
                    tcp.name
                )));
            }
            if tcp.port == 0 || tcp.fallback_ports.contains(&0) {
                return Err(ConfigError::ValidationError(format!(
                    "tcp collector '{}': ports must be non-zero",
                    tcp.name
                )));
            }
            if tcp.timeout.is_zero() || tcp.deadline < tcp.timeout {
                return Err(ConfigError::ValidationError(format!(
                    "tcp collector '{}': timeout must be non-zero and no longer than deadline",
                    tcp.name
                )));
            }
        }

        Ok(())
    }

    /// Build a registry holding every enabled collector.
    pub fn registry(&self) -> Result<CollectorRegistry, ConfigError> {
        let mut registry = CollectorRegistry::new();
        for tcp in self.tcp.iter().filter(|c| c.enabled) {
            registry
                .register(Arc::new(TcpCollector::new(tcp.clone())))
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }
        Ok(registry)
    }

    /// Load collector configurations from all YAML files in a directory.
    pub fn load_from_dir(dir_path: &str) -> Result<Self, ConfigError> {
        let dir = Path::new(dir_path);
        if !dir.is_dir() {
            return Err(ConfigError::ValidationError(format!(
                "collector_path '{dir_path}' is not a directory"
            )));
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
            })
            .collect();
        // Stable merge order regardless of directory listing order.
        paths.sort();

        let mut merged = Self::default();
        for path in paths {
            tracing::debug!(path = %path.display(), "Loading collector config");
            let content = std::fs::read_to_string(&path)?;
            let file_config: Self = serde_yaml::from_str(&content).map_err(|e| {
                ConfigError::ValidationError(format!("failed to parse '{}': {}", path.display(), e))
            })?;
            merged = merged.merge(file_config);
        }

        Ok(merged)
    }
}
