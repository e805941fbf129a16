//! User-facing sink handle.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::model::TaskResult;
use crate::sink::actor::Command;
use crate::sink::{ResultRecord, SinkError};
use crate::sync::lock;

/// State shared between the handle and the actor.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) pushed: AtomicU64,
    pub(crate) written: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) buffered: AtomicUsize,
    pub(crate) peak_buffered: AtomicUsize,
    pub(crate) constrained: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl Shared {
    pub(crate) fn failure(&self) -> Option<String> {
        lock(&self.failure).clone()
    }

    pub(crate) fn set_failure(&self, message: String) {
        lock(&self.failure).get_or_insert(message);
    }
}

/// Sink counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    /// Records accepted by `push`.
    pub pushed: u64,
    /// Records written to the output.
    pub written: u64,
    /// Batches written.
    pub flushes: u64,
    /// Records currently buffered in the actor.
    pub buffered: usize,
    /// Highest buffer occupancy seen.
    pub peak_buffered: usize,
    /// Constrained mode is active.
    pub constrained: bool,
}

/// Handle to the streaming result sink. Cheap to clone.
#[derive(Clone)]
pub struct ResultSink {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
    handle: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
    location: String,
}

impl std::fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSink")
            .field("location", &self.location)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ResultSink {
    pub(crate) fn new(
        tx: mpsc::Sender<Command>,
        handle: JoinHandle<()>,
        shared: Arc<Shared>,
        location: String,
    ) -> Self {
        Self {
            tx,
            shared,
            handle: Arc::new(tokio::sync::Mutex::new(Some(handle))),
            location,
        }
    }

    /// Output location.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Queue a result for writing. Waits while the channel is full.
    ///
    /// # Errors
    /// `SinkError::Write` once a write has failed, `SinkError::Closed` after
    /// finalize.
    pub async fn push(&self, result: &TaskResult) -> Result<(), SinkError> {
        if let Some(message) = self.shared.failure() {
            return Err(SinkError::Write(message));
        }
        self.tx
            .send(Command::Push(ResultRecord::from(result)))
            .await
            .map_err(|_| SinkError::Closed)?;
        self.shared.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write everything buffered so far.
    pub async fn flush(&self) -> Result<(), SinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .await
            .map_err(|_| SinkError::Closed)?;
        rx.await.map_err(|_| SinkError::Closed)?
    }

    /// Enter or leave constrained mode.
    pub async fn set_constrained(&self, on: bool) -> Result<(), SinkError> {
        self.tx
            .send(Command::SetConstrained(on))
            .await
            .map_err(|_| SinkError::Closed)
    }

    /// Flush, make durable, stop the actor, and return the output location.
    ///
    /// Safe to call more than once; later calls return the same location, or
    /// the recorded write failure.
    pub async fn finalize(&self) -> Result<String, SinkError> {
        let mut handle = self.handle.lock().await;
        if let Some(join) = handle.take() {
            let (reply, rx) = oneshot::channel();
            let result = match self.tx.send(Command::Shutdown(reply)).await {
                Ok(()) => rx.await.unwrap_or(Err(SinkError::Closed)),
                Err(_) => Err(SinkError::Closed),
            };
            if let Err(e) = join.await {
                tracing::error!(error = %e, "Sink actor ended abnormally");
            }
            if let Err(e) = result {
                self.shared.set_failure(e.to_string());
            }
            let stats = self.stats();
            tracing::info!(location = %self.location, written = stats.written, peak_buffered = stats.peak_buffered, "Result sink finalized");
        }

        match self.shared.failure() {
            Some(message) => Err(SinkError::Write(message)),
            None => Ok(self.location.clone()),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> SinkStats {
        SinkStats {
            pushed: self.shared.pushed.load(Ordering::Relaxed),
            written: self.shared.written.load(Ordering::Relaxed),
            flushes: self.shared.flushes.load(Ordering::Relaxed),
            buffered: self.shared.buffered.load(Ordering::Relaxed),
            peak_buffered: self.shared.peak_buffered.load(Ordering::Relaxed),
            constrained: self.shared.constrained.load(Ordering::Relaxed),
        }
    }
}
