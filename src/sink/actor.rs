//! Writer actor owning the result writer, fed through a bounded MPSC channel.
//!
//! Single-writer pattern: one tokio task owns the [`ResultWriter`] and
//! processes commands in order. Records are buffered and flushed when the
//! buffer reaches its size threshold or its time threshold elapses.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::sink::facade::Shared;
use crate::sink::{ResultRecord, ResultWriter, SinkError};

/// Constrained mode divides both thresholds by this factor.
const CONSTRAINED_FACTOR: u32 = 4;

/// Floor for the constrained flush interval.
const MIN_CONSTRAINED_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Commands
// =============================================================================

/// Commands sent to the writer actor.
#[derive(Debug)]
pub(crate) enum Command {
    /// Buffer a record.
    Push(ResultRecord),
    /// Flush the buffer now and report the outcome.
    Flush(oneshot::Sender<Result<(), SinkError>>),
    /// Enter or leave constrained mode.
    SetConstrained(bool),
    /// Flush, make durable, and stop.
    Shutdown(oneshot::Sender<Result<(), SinkError>>),
}

// =============================================================================
// Buffer
// =============================================================================

/// Record buffer with size-based and time-based flushing.
#[derive(Debug)]
pub(crate) struct BatchBuffer<T> {
    items: Vec<T>,
    last_flush: Instant,
    threshold: usize,
    interval: Duration,
}

impl<T> BatchBuffer<T> {
    pub(crate) fn new(threshold: usize, interval: Duration) -> Self {
        let threshold = threshold.max(1);
        Self {
            items: Vec::with_capacity(threshold),
            last_flush: Instant::now(),
            threshold,
            interval,
        }
    }

    pub(crate) fn push(&mut self, item: T) {
        // Reset flush timer on first item so a long-idle buffer is not overdue.
        if self.items.is_empty() {
            self.last_flush = Instant::now();
        }
        self.items.push(item);
    }

    pub(crate) fn should_flush(&self) -> bool {
        self.items.len() >= self.threshold
            || (!self.items.is_empty() && self.last_flush.elapsed() >= self.interval)
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        (!self.items.is_empty()).then(|| self.last_flush + self.interval)
    }

    pub(crate) fn take(&mut self) -> Vec<T> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.items)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn set_limits(&mut self, threshold: usize, interval: Duration) {
        self.threshold = threshold.max(1);
        self.interval = interval;
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Result writer actor.
pub(crate) struct SinkActor {
    writer: Box<dyn ResultWriter>,
    rx: mpsc::Receiver<Command>,
    buffer: BatchBuffer<ResultRecord>,
    shared: Arc<Shared>,
    buffer_size: usize,
    flush_interval: Duration,
}

impl SinkActor {
    /// Spawn the actor task.
    pub(crate) fn spawn(
        writer: Box<dyn ResultWriter>,
        buffer_size: usize,
        flush_interval: Duration,
        channel_capacity: usize,
        shared: Arc<Shared>,
    ) -> (JoinHandle<()>, mpsc::Sender<Command>) {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let buffer_size = buffer_size.max(1);
        let mut actor = SinkActor {
            writer,
            rx,
            buffer: BatchBuffer::new(buffer_size, flush_interval),
            shared,
            buffer_size,
            flush_interval,
        };
        let handle = tokio::spawn(async move { actor.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        tracing::debug!(location = %self.writer.location(), "Sink actor started");

        loop {
            let deadline = self.buffer.deadline();
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break; // Shutdown requested
                        }
                    }
                    None => {
                        tracing::warn!("Sink channel disconnected, shutting down");
                        let _ = self.flush().await;
                        let _ = self.writer.finish().await;
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    // Time threshold reached
                }
            }

            if self.buffer.should_flush() {
                let _ = self.flush().await;
            }
        }

        tracing::debug!("Sink actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Push(record) => {
                self.buffer.push(record);
                let len = self.buffer.len();
                self.shared.buffered.store(len, Ordering::Relaxed);
                self.shared.peak_buffered.fetch_max(len, Ordering::Relaxed);
            }
            Command::Flush(reply) => {
                let _ = reply.send(self.flush().await);
            }
            Command::SetConstrained(on) => self.set_constrained(on),
            Command::Shutdown(reply) => {
                let mut result = self.flush().await;
                if result.is_ok() {
                    result = self.writer.finish().await;
                }
                let _ = reply.send(result);
                return true;
            }
        }
        false
    }

    fn set_constrained(&mut self, on: bool) {
        let (threshold, interval) = if on {
            (
                (self.buffer_size / CONSTRAINED_FACTOR as usize).max(1),
                (self.flush_interval / CONSTRAINED_FACTOR).max(MIN_CONSTRAINED_INTERVAL),
            )
        } else {
            (self.buffer_size, self.flush_interval)
        };
        self.buffer.set_limits(threshold, interval);
        self.shared.constrained.store(on, Ordering::Relaxed);
        tracing::debug!(constrained = on, threshold, interval_ms = interval.as_millis() as u64, "Sink limits changed");
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(message) = self.shared.failure() {
            return Err(SinkError::Write(message));
        }
        if self.buffer.is_empty() {
            return Ok(());
        }

        let records = self.buffer.take();
        self.shared.buffered.store(0, Ordering::Relaxed);
        match self.writer.write_batch(&records).await {
            Ok(()) => {
                self.shared
                    .written
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                self.shared.flushes.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(count = records.len(), "Result batch written");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, count = records.len(), "Result batch write failed");
                self.shared.set_failure(e.to_string());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_buffer_size_threshold() {
        let mut buffer = BatchBuffer::new(3, Duration::from_secs(60));
        buffer.push(1);
        buffer.push(2);
        assert!(!buffer.should_flush());
        buffer.push(3);
        assert!(buffer.should_flush());
        assert_eq!(buffer.take(), vec![1, 2, 3]);
        assert!(buffer.is_empty());
        assert!(buffer.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_time_threshold() {
        let mut buffer = BatchBuffer::new(100, Duration::from_secs(1));
        buffer.push("a");
        assert!(!buffer.should_flush());
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(buffer.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_buffer_is_not_overdue() {
        let mut buffer = BatchBuffer::new(100, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(10)).await;
        buffer.push("a");
        assert!(!buffer.should_flush());
    }
}
