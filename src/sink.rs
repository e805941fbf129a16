//! Streaming Result Sink
//!
//! Results are appended to disk as they complete, never held as a full set.
//!
//! # Architecture
//!
//! - **Single writer**: one tokio task ([`actor`]) owns the [`ResultWriter`]
//!   and drains a bounded MPSC channel. A full channel makes `push` wait,
//!   which is the backpressure path back into the worker pool.
//! - **Batch buffering**: records are buffered until `buffer_size` records
//!   or `flush_interval` elapsed, whichever comes first. The buffer never
//!   exceeds `buffer_size`.
//! - **Constrained mode**: under host pressure thresholds shrink by a factor
//!   of four so less memory is held.
//!
//! # Output
//!
//! [`JsonLinesWriter`] appends one [`ResultRecord`] per line to
//! `<output_dir>/<run_id>.results.jsonl`. Line order is completion order.

mod actor;
mod builder;
mod error;
mod facade;
mod writer;

use std::path::{Path, PathBuf};

pub use builder::{DEFAULT_BUFFER_SIZE, DEFAULT_CHANNEL_CAPACITY, DEFAULT_FLUSH_INTERVAL, SinkBuilder};
pub use error::SinkError;
pub use facade::{ResultSink, SinkStats};
pub use writer::{JsonLinesWriter, ResultRecord, ResultWriter};

/// Results file for `run_id` under `output_dir`.
pub fn results_path(output_dir: impl AsRef<Path>, run_id: &str) -> PathBuf {
    output_dir.as_ref().join(format!("{run_id}.results.jsonl"))
}
