//! Reachability probes. A probe never fails: anything other than a clean
//! answer counts as unreachable.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use crate::config::{MonitorConfig, ProbeKind};

#[async_trait]
pub trait ReachabilityProber: Send + Sync {
    /// True only if `address` answered within the probe budget.
    async fn probe(&self, address: &str) -> bool;
}

/// One ICMP echo through the system `ping` utility
pub struct IcmpProber {
    echo_wait_secs: u64,
    timeout: Duration,
}

impl IcmpProber {
    pub fn new(echo_wait_secs: u64, timeout: Duration) -> Self {
        Self { echo_wait_secs, timeout }
    }
}

#[async_trait]
impl ReachabilityProber for IcmpProber {
    async fn probe(&self, address: &str) -> bool {
        // never let an address be parsed as a ping option
        if address.is_empty() || address.starts_with('-') {
            tracing::warn!("Refusing to ping suspicious address {:?}", address);
            return false;
        }

        let wait = self.echo_wait_secs.max(1).to_string();
        let child = Command::new("ping")
            .args(["-c", "1", "-W", wait.as_str(), address])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("Failed to spawn ping for {}: {}", address, e);
                return false;
            }
        };

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!("ping {} failed: {}", address, e);
                false
            }
            Err(_) => {
                tracing::debug!("ping {} timed out after {:?}", address, self.timeout);
                false
            }
        }
    }
}

/// TCP connect to a fixed port, for devices that drop ICMP
pub struct TcpProber {
    port: u16,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl ReachabilityProber for TcpProber {
    async fn probe(&self, address: &str) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect((address, self.port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!("connect {}:{} failed: {}", address, self.port, e);
                false
            }
            Err(_) => false,
        }
    }
}

pub fn from_config(config: &MonitorConfig) -> Arc<dyn ReachabilityProber> {
    let timeout = Duration::from_millis(config.probe_timeout_ms);
    match config.probe {
        ProbeKind::Icmp => Arc::new(IcmpProber::new(config.echo_wait_secs, timeout)),
        ProbeKind::Tcp => Arc::new(TcpProber::new(config.tcp_port, timeout)),
    }
}
