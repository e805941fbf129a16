//! Sink-specific error types.

use thiserror::Error;

/// Errors that can occur in the result sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// File I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Record serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An earlier write failed; the sink no longer accepts results.
    #[error("sink write failed: {0}")]
    Write(String),

    /// Writer actor has stopped.
    #[error("sink is closed")]
    Closed,
}
