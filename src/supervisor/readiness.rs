//! Readiness probes for freshly spawned providers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::Endpoint;

/// Decides whether a spawned provider accepts traffic yet.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, endpoint: &Endpoint) -> bool;
}

/// Ready once a TCP connection to the allocated port succeeds.
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn is_ready(&self, endpoint: &Endpoint) -> bool {
        let addr = (endpoint.host.as_str(), endpoint.port);
        matches!(
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_probe_sees_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
        };
        assert!(TcpProbe::default().is_ready(&endpoint).await);

        drop(listener);
        assert!(!TcpProbe::default().is_ready(&endpoint).await);
    }
}
