//! Sink builder.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::sink::actor::SinkActor;
use crate::sink::facade::Shared;
use crate::sink::{JsonLinesWriter, ResultSink, ResultWriter, SinkError};

/// Default records buffered before a flush.
pub const DEFAULT_BUFFER_SIZE: usize = 500;

/// Default time before a non-empty buffer is flushed.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default command channel capacity.
///
/// A full channel blocks producers, so this bounds memory held between the
/// worker pool and the writer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Builder for the result sink.
#[derive(Debug, Clone)]
pub struct SinkBuilder {
    path: PathBuf,
    buffer_size: usize,
    flush_interval: Duration,
    channel_capacity: usize,
}

impl SinkBuilder {
    /// Sink appending JSON Lines to `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the buffer size threshold (minimum 1).
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Set the time threshold.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the channel capacity (minimum 1).
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Open the output file and spawn the writer actor.
    pub async fn build(self) -> Result<ResultSink, SinkError> {
        let writer = JsonLinesWriter::open(&self.path).await?;
        Ok(self.build_with_writer(Box::new(writer)))
    }

    /// Spawn the writer actor around a custom writer. Must run inside a tokio runtime.
    pub fn build_with_writer(self, writer: Box<dyn ResultWriter>) -> ResultSink {
        let location = writer.location();
        let shared = Arc::new(Shared::default());
        let (handle, tx) = SinkActor::spawn(
            writer,
            self.buffer_size,
            self.flush_interval,
            self.channel_capacity,
            Arc::clone(&shared),
        );
        tracing::debug!(location = %location, buffer_size = self.buffer_size, channel_capacity = self.channel_capacity, "Result sink built");
        ResultSink::new(tx, handle, shared, location)
    }
}
