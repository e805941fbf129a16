//! Collector Layer
//!
//! Collectors are the data-gathering probes run against each target. The
//! orchestration core only reads their metadata and invokes them; what they
//! collect is opaque JSON.
//!
//! # Architecture
//!
//! - [`Collector`]: capability trait (metadata, primary and degraded invocation)
//! - [`CollectContext`]: per-attempt context handed to a collector
//! - [`CollectorRegistry`]: name to implementation lookup
//! - [`tcp`]: reference TCP port probe
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use argus::{CollectorRegistry, TcpCollector, TcpConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = CollectorRegistry::new();
//! let config = TcpConfig::new("ssh", 22).with_timeout(Duration::from_secs(2));
//! registry.register(Arc::new(TcpCollector::new(config)))?;
//! # Ok(())
//! # }
//! ```

mod registry;
pub mod tcp;
mod traits;

pub use registry::CollectorRegistry;
pub use traits::{
    CollectContext, Collector, CollectorError, CollectorMeta, DEFAULT_COLLECTOR_TIMEOUT,
};
