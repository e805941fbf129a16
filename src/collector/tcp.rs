//! TCP collectors for probing TCP endpoints on audited targets.
//!
//! - [`TcpCollector`]: TCP port reachability and connect latency probe

mod collector;

pub use collector::{TcpCollector, TcpConfig};
