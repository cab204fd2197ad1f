//! Manager readiness probing
//!
//! An accepted TCP connection only shows that the manager booted far enough
//! to open the port. It does not prove `docker swarm init` finished or that
//! the join token was published, so a successful probe means "likely ready".
//! Requiring the swarm port (2377) in `confirm_ports` narrows that gap since
//! it only opens once the swarm is initialised.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// Port probed by default (SSH)
pub const DEFAULT_PROBE_PORT: u16 = 22;

/// Probe settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Primary port
    pub port: u16,
    /// Additional ports that must also accept connections
    pub confirm_ports: Vec<u16>,
    /// Delay after each failed attempt
    pub poll_interval: Duration,
    /// Attempt budget
    pub max_attempts: u32,
    /// Per-connection timeout
    pub connect_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PROBE_PORT,
            confirm_ports: Vec::new(),
            poll_interval: Duration::from_secs(10),
            max_attempts: 30,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ProbeConfig {
    /// All ports an attempt must reach
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = vec![self.port];
        for port in &self.confirm_ports {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports
    }
}

/// Result of a bounded probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Whether the target accepted connections
    pub ready: bool,
    /// Attempts made
    pub attempts: u32,
    /// Time spent probing
    pub elapsed: Duration,
}

impl ProbeOutcome {
    /// Check if the target became reachable
    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

/// Something that can wait for a node to accept connections
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Poll `address` until it is reachable or the attempt budget runs out
    async fn await_ready(&self, address: &str) -> ProbeOutcome;

    /// Port reported in timeout errors
    fn port(&self) -> u16;
}

/// TCP connect probe
#[derive(Debug, Clone, Default)]
pub struct TcpProbe {
    config: ProbeConfig,
}

impl TcpProbe {
    /// Create a probe with the given settings
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Probe settings
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn await_ready(&self, address: &str) -> ProbeOutcome {
        poll(
            address,
            &self.config.ports(),
            self.config.poll_interval,
            self.config.max_attempts,
            self.config.connect_timeout,
        )
        .await
    }

    fn port(&self) -> u16 {
        self.config.port
    }
}

/// Wait until `address:port` accepts a TCP connection
///
/// Returns as soon as an attempt succeeds, without sleeping. Each failed
/// attempt is followed by `poll_interval`; after `max_attempts` failures the
/// outcome is not ready.
pub async fn await_ready(
    address: &str,
    port: u16,
    poll_interval: Duration,
    max_attempts: u32,
) -> ProbeOutcome {
    poll(
        address,
        &[port],
        poll_interval,
        max_attempts,
        ProbeConfig::default().connect_timeout,
    )
    .await
}

async fn poll(
    address: &str,
    ports: &[u16],
    poll_interval: Duration,
    max_attempts: u32,
    connect_timeout: Duration,
) -> ProbeOutcome {
    let started = Instant::now();
    let mut attempts = 0;

    while attempts < max_attempts {
        attempts += 1;
        if attempt(address, ports, connect_timeout).await {
            tracing::debug!("{} reachable after {} attempts", address, attempts);
            return ProbeOutcome {
                ready: true,
                attempts,
                elapsed: started.elapsed(),
            };
        }
        tracing::debug!(
            "Waiting for {} to accept connections ({}/{})",
            address,
            attempts,
            max_attempts
        );
        tokio::time::sleep(poll_interval).await;
    }

    ProbeOutcome {
        ready: false,
        attempts,
        elapsed: started.elapsed(),
    }
}

async fn attempt(address: &str, ports: &[u16], connect_timeout: Duration) -> bool {
    for port in ports {
        match tokio::time::timeout(connect_timeout, TcpStream::connect((address, *port))).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::debug!("Connect to {}:{} failed: {}", address, port, e);
                return false;
            }
            Err(_) => {
                tracing::debug!("Connect to {}:{} timed out", address, port);
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_immediate_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let outcome = await_ready("127.0.0.1", port, Duration::from_secs(5), 3).await;

        assert!(outcome.is_ready());
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_bounded_failure() {
        let port = closed_port().await;
        let interval = Duration::from_millis(20);

        let outcome = await_ready("127.0.0.1", port, interval, 4).await;

        assert!(!outcome.is_ready());
        assert_eq!(outcome.attempts, 4);
        assert!(outcome.elapsed >= interval * 4);
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_zero_attempts() {
        let outcome = await_ready("127.0.0.1", 1, Duration::from_millis(10), 0).await;
        assert!(!outcome.is_ready());
        assert_eq!(outcome.attempts, 0);
    }

    #[tokio::test]
    async fn test_confirm_ports_must_all_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = closed_port().await;

        let probe = TcpProbe::new(ProbeConfig {
            port: open,
            confirm_ports: vec![closed],
            poll_interval: Duration::from_millis(10),
            max_attempts: 2,
            connect_timeout: Duration::from_secs(1),
        });

        let outcome = probe.await_ready("127.0.0.1").await;
        assert!(!outcome.is_ready());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(probe.port(), open);
    }

    #[test]
    fn test_ports_dedup() {
        let config = ProbeConfig {
            confirm_ports: vec![2377, 22, 2377],
            ..Default::default()
        };
        assert_eq!(config.ports(), vec![22, 2377]);
    }
}
