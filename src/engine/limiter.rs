//! Adjustable concurrency limiter.
//!
//! The limit is a single atomic that may change at any time; admission is a
//! compare-and-swap on the active count. Lowering the limit never preempts
//! running work, it only delays new admissions until enough permits drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Live-adjustable admission gate.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    limit: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    notify: Notify,
}

impl ConcurrencyLimiter {
    /// Limiter admitting up to `limit` holders (minimum 1).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit.max(1)),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Current limit.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Change the limit (minimum 1). Returns the previous value.
    pub fn set_limit(&self, limit: usize) -> usize {
        let previous = self.limit.swap(limit.max(1), Ordering::AcqRel);
        if limit > previous {
            self.notify.notify_waiters();
        }
        previous
    }

    /// Permits currently held.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Highest number of permits held at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Take a permit if one is free.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        self.try_admit().then(|| Permit {
            limiter: Arc::clone(self),
        })
    }

    /// Wait for a permit.
    pub async fn acquire(self: &Arc<Self>) -> Permit {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release between check and await is not lost.
            notified.as_mut().enable();

            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            notified.await;
        }
    }

    fn try_admit(&self) -> bool {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.limit.load(Ordering::Acquire) {
                return false;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(current + 1, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

/// A held execution slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
