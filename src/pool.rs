//! Connection Pool
//!
//! Caches one session per target for a bounded time so the many collectors
//! run against a target share its name resolution and connection setup.
//!
//! - [`ConnectionPool`]: acquire / release / invalidate / stats / close
//! - [`SessionHandle`]: immutable, TTL-bounded session data
//! - [`SessionLease`]: a task's claim on a handle; dropping it releases
//! - [`Connector`]: how a new session is established ([`ResolvingConnector`]
//!   resolves names with retry)
//!
//! TTL is checked on every reuse; an expired handle is never returned.
//! Session setup is abandoned as soon as the caller's cancellation token fires.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::{Classify, ErrorClass};
use crate::model::Target;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::sync::lock;

/// Default session TTL (5 minutes).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Port used for name resolution when the target carries none.
pub const DEFAULT_RESOLVE_PORT: u16 = 22;

// =============================================================================
// Errors
// =============================================================================

/// Session establishment errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Name resolution failed.
    #[error("failed to resolve {target} after {attempts} attempt(s): {message}")]
    Resolve {
        target: String,
        attempts: u32,
        message: String,
    },

    /// Resolution succeeded but produced no addresses.
    #[error("no addresses resolved for {0}")]
    NoAddresses(String),

    /// Session setup failed after resolution.
    #[error("failed to connect to {target}: {message}")]
    Connect { target: String, message: String },

    /// Pool has been closed.
    #[error("connection pool is closed")]
    Closed,

    /// The caller cancelled while the session was being set up.
    #[error("session setup for {0} cancelled")]
    Cancelled(String),
}

impl Classify for PoolError {
    fn error_class(&self) -> ErrorClass {
        match self {
            Self::Resolve { .. } | Self::NoAddresses(_) => ErrorClass::NameResolution,
            Self::Connect { .. } => ErrorClass::Connectivity,
            Self::Closed | Self::Cancelled(_) => ErrorClass::Unclassified,
        }
    }
}

// =============================================================================
// Sessions
// =============================================================================

/// Reusable session to one target.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    target: Target,
    addrs: Vec<SocketAddr>,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    ttl: Duration,
}

impl SessionHandle {
    /// Create a handle for `target` with resolved `addrs`.
    pub fn new(target: Target, addrs: Vec<SocketAddr>, ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            addrs,
            created_at: Instant::now(),
            created_wall: Utc::now(),
            ttl,
        }
    }

    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Target the session belongs to.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Resolved addresses, in resolver order.
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_wall
    }

    /// Time since creation.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// True once the handle has lived for its TTL. A zero TTL is always expired.
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// A task's claim on a session. Dropping the lease releases it.
#[derive(Debug)]
pub struct SessionLease {
    handle: Arc<SessionHandle>,
    active: Arc<AtomicUsize>,
}

impl SessionLease {
    /// The leased handle.
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Establishes new sessions.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Resolve and connect to `target`, returning its addresses.
    ///
    /// Implementations should give up with [`PoolError::Cancelled`] once
    /// `cancel` fires.
    async fn connect(
        &self,
        target: &Target,
        cancel: &CancellationToken,
    ) -> Result<Vec<SocketAddr>, PoolError>;
}

/// DNS resolution through `tokio::net::lookup_host`, retried on failure.
#[derive(Debug, Clone)]
pub struct ResolvingConnector {
    default_port: u16,
    retry: RetryPolicy,
}

impl Default for ResolvingConnector {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLVE_PORT, RetryPolicy::default())
    }
}

impl ResolvingConnector {
    /// Create a connector.
    pub fn new(default_port: u16, retry: RetryPolicy) -> Self {
        Self {
            default_port,
            retry,
        }
    }
}

#[async_trait::async_trait]
impl Connector for ResolvingConnector {
    async fn connect(
        &self,
        target: &Target,
        cancel: &CancellationToken,
    ) -> Result<Vec<SocketAddr>, PoolError> {
        let host = target.host().to_owned();
        let port = target.port().unwrap_or(self.default_port);

        let executor = RetryExecutor::new(self.retry);
        let (addrs, _) = executor
            .execute(cancel, |_| {
                let host = host.clone();
                async move {
                    tokio::net::lookup_host((host.as_str(), port))
                        .await
                        .map(|it| it.collect::<Vec<_>>())
                }
            })
            .await
            .map_err(|e| {
                if e.is_cancelled() {
                    return PoolError::Cancelled(target.id().to_owned());
                }
                PoolError::Resolve {
                    target: target.id().to_owned(),
                    attempts: e.attempts(),
                    message: e
                        .last()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| e.to_string()),
                }
            })?;

        if addrs.is_empty() {
            return Err(PoolError::NoAddresses(target.id().to_owned()));
        }
        Ok(addrs)
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Acquires served from cache.
    pub hits: u64,
    /// Acquires that needed a new session.
    pub misses: u64,
    /// Sessions created.
    pub created: u64,
    /// Sessions dropped on TTL expiry.
    pub evicted: u64,
    /// Sessions dropped by `invalidate`.
    pub invalidated: u64,
    /// Leases currently held.
    pub active_leases: usize,
    /// Sessions currently cached.
    pub cached: usize,
}

impl PoolStats {
    /// Hit rate in `[0, 1]`; zero when nothing was acquired.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    sessions: HashMap<String, Arc<SessionHandle>>,
    hits: u64,
    misses: u64,
    created: u64,
    evicted: u64,
    invalidated: u64,
}

/// TTL-bounded session cache keyed by target.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    ttl: Duration,
    state: Mutex<PoolState>,
    active: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool using the default [`ResolvingConnector`].
    pub fn new(ttl: Duration) -> Self {
        Self::with_connector(ttl, Arc::new(ResolvingConnector::default()))
    }

    /// Create a pool with a custom connector.
    pub fn with_connector(ttl: Duration, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            ttl,
            state: Mutex::new(PoolState::default()),
            active: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Session TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Lease a session for `target`, reusing a live cached one if present.
    ///
    /// # Errors
    /// `PoolError::Closed` after [`close`](Self::close), `PoolError::Cancelled`
    /// when `cancel` fires before a new session is ready, otherwise whatever
    /// the connector reports.
    pub async fn acquire(
        &self,
        target: &Target,
        cancel: &CancellationToken,
    ) -> Result<SessionLease, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled(target.id().to_owned()));
        }

        {
            let mut state = lock(&self.state);
            let cached = state.sessions.get(target.id()).cloned();
            match cached {
                Some(handle) if !handle.is_expired() => {
                    state.hits += 1;
                    drop(state);
                    tracing::trace!(target = %target, session = %handle.id(), "Session cache hit");
                    return Ok(self.lease(handle));
                }
                Some(_) => {
                    state.sessions.remove(target.id());
                    state.evicted += 1;
                }
                None => {}
            }
            state.misses += 1;
        }

        let addrs = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(target = %target, "Session setup cancelled");
                return Err(PoolError::Cancelled(target.id().to_owned()));
            }
            addrs = self.connector.connect(target, cancel) => addrs?,
        };
        let handle = Arc::new(SessionHandle::new(target.clone(), addrs, self.ttl));
        tracing::debug!(target = %target, session = %handle.id(), addrs = handle.addrs().len(), "Session created");

        let mut state = lock(&self.state);
        state.created += 1;
        if !self.closed.load(Ordering::Acquire) {
            state
                .sessions
                .insert(target.id().to_owned(), Arc::clone(&handle));
        }
        drop(state);

        Ok(self.lease(handle))
    }

    /// Return a lease after a successful use.
    pub fn release(&self, lease: SessionLease) {
        drop(lease);
    }

    /// Discard the session behind `lease` so the next acquire creates a new one.
    pub fn invalidate(&self, lease: SessionLease) {
        let handle = Arc::clone(lease.handle());
        drop(lease);

        let mut state = lock(&self.state);
        let key = handle.target().id();
        if state
            .sessions
            .get(key)
            .is_some_and(|cached| cached.id() == handle.id())
        {
            state.sessions.remove(key);
            state.invalidated += 1;
            tracing::debug!(target = %handle.target(), session = %handle.id(), "Session invalidated");
        }
    }

    /// Drop every expired cached session. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut state = lock(&self.state);
        let before = state.sessions.len();
        state.sessions.retain(|_, handle| !handle.is_expired());
        let removed = before - state.sessions.len();
        state.evicted += removed as u64;
        removed
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            hits: state.hits,
            misses: state.misses,
            created: state.created,
            evicted: state.evicted,
            invalidated: state.invalidated,
            active_leases: self.active.load(Ordering::Relaxed),
            cached: state.sessions.len(),
        }
    }

    /// Drop all cached sessions and refuse further acquires.
    ///
    /// Outstanding leases stay valid until their holders drop them.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = lock(&self.state);
        let count = state.sessions.len();
        state.sessions.clear();
        tracing::debug!(sessions = count, "Connection pool closed");
    }

    /// True after [`close`](Self::close).
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lease(&self, handle: Arc<SessionHandle>) -> SessionLease {
        self.active.fetch_add(1, Ordering::Relaxed);
        SessionLease {
            handle,
            active: Arc::clone(&self.active),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
