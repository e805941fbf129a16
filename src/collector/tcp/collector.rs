//! TCP port probe collector.
//!
//! Connects to a port on every audited target and reports connect latency.
//! When fallback ports are configured, a failed primary probe degrades to
//! probing those instead and the result is reported as a partial success.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::collector::{
    CollectContext, Collector, CollectorError, CollectorMeta, DEFAULT_COLLECTOR_TIMEOUT,
};

/// Default connection timeout (3 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_deadline() -> Duration {
    DEFAULT_COLLECTOR_TIMEOUT
}

/// Configuration for the TCP port probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Unique collector name.
    pub name: String,
    /// Port to probe, unless the target carries an explicit `host:port`.
    pub port: u16,
    /// Enable this collector (default: true).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Probe timeout (default: 3s).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Whole-task budget across retries and fallback ports (default: 30s).
    #[serde(default = "default_deadline", with = "humantime_serde")]
    pub deadline: Duration,
    /// Escalate failures in reports (default: false).
    #[serde(default)]
    pub critical: bool,
    /// Ports probed in degraded mode when the primary port fails.
    #[serde(default)]
    pub fallback_ports: Vec<u16>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

impl TcpConfig {
    /// Create a new TCP probe configuration.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            enabled: true,
            timeout: DEFAULT_TIMEOUT,
            deadline: DEFAULT_COLLECTOR_TIMEOUT,
            critical: false,
            fallback_ports: Vec::new(),
            description: None,
        }
    }

    /// Set the probe timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the whole-task deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Mark the probe critical.
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Set degraded-mode ports.
    pub fn with_fallback_ports(mut self, ports: impl Into<Vec<u16>>) -> Self {
        self.fallback_ports = ports.into();
        self
    }

    /// Set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// TCP port probe collector.
#[derive(Debug, Clone)]
pub struct TcpCollector {
    config: TcpConfig,
}

impl TcpCollector {
    /// Create a new TCP collector.
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }

    /// Probe configuration.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Try each resolved address on `port` until one accepts.
    async fn probe(&self, ctx: &CollectContext, port: u16) -> Result<Probe, CollectorError> {
        let port = ctx.target.port().unwrap_or(port);
        let mut last_err = None;

        for ip in ctx.session.addrs().iter().map(SocketAddr::ip) {
            let addr = SocketAddr::new(ip, port);
            let start = Instant::now();
            match timeout(self.config.timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => {
                    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                    tracing::debug!(name = %self.config.name, target = %ctx.target, %addr, latency_ms, "TCP probe successful");
                    return Ok(Probe { addr, latency_ms });
                }
                Ok(Err(e)) => {
                    tracing::debug!(name = %self.config.name, target = %ctx.target, %addr, error = %e, "TCP probe failed");
                    last_err = Some(CollectorError::Io(e));
                }
                Err(_) => {
                    tracing::debug!(name = %self.config.name, target = %ctx.target, %addr, timeout_ms = self.config.timeout.as_millis() as u64, "TCP probe timed out");
                    last_err = Some(CollectorError::Timeout(self.config.timeout));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            CollectorError::Other(format!("no addresses for {}", ctx.target))
        }))
    }
}

struct Probe {
    addr: SocketAddr,
    latency_ms: f64,
}

#[async_trait::async_trait]
impl Collector for TcpCollector {
    fn meta(&self) -> CollectorMeta {
        CollectorMeta::new(self.config.name.clone())
            .with_timeout(self.config.deadline)
            .with_critical(self.config.critical)
            .with_degraded(!self.config.fallback_ports.is_empty())
    }

    async fn invoke(&self, ctx: &CollectContext) -> Result<serde_json::Value, CollectorError> {
        let probe = self.probe(ctx, self.config.port).await?;
        Ok(serde_json::json!({
            "addr": probe.addr.to_string(),
            "port": probe.addr.port(),
            "open": true,
            "latency_ms": probe.latency_ms,
        }))
    }

    async fn invoke_degraded(
        &self,
        ctx: &CollectContext,
    ) -> Option<Result<serde_json::Value, CollectorError>> {
        if self.config.fallback_ports.is_empty() {
            return None;
        }

        let mut last_err = None;
        for &port in &self.config.fallback_ports {
            match self.probe(ctx, port).await {
                Ok(probe) => {
                    return Some(Ok(serde_json::json!({
                        "addr": probe.addr.to_string(),
                        "port": probe.addr.port(),
                        "open": true,
                        "latency_ms": probe.latency_ms,
                        "primary_port": self.config.port,
                    })));
                }
                Err(e) => last_err = Some(e),
            }
        }
        last_err.map(Err)
    }
}
