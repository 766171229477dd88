//! Default balancer
//!
//! Dials the requested address itself. Upstream selection and QoS tiers are
//! the business of a real balancer; this one only records the tier asked for.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{InterceptError, Result};
use crate::proxy::conn::BoxedConnection;
use crate::proxy::dialer::{Balancer, NETWORK_TCP};

/// Balancer that connects straight to the destination
pub struct DirectBalancer {
    connect_timeout: Duration,
}

impl DirectBalancer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for DirectBalancer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Balancer for DirectBalancer {
    #[instrument(skip(self))]
    async fn dial_qos(&self, network: &str, addr: &str, qos: i64) -> Result<BoxedConnection> {
        if network != NETWORK_TCP {
            return Err(InterceptError::DialFailed(format!(
                "unsupported network: {}",
                network
            )));
        }

        debug!("Dialing {} directly (qos {})", addr, qos);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| InterceptError::Timeout)?
            .map_err(|e| InterceptError::DialFailed(format!("TCP connect failed: {}", e)))?;

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::conn::Connection;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dials_listening_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let balancer = DirectBalancer::default();
        let conn = balancer
            .dial_qos(NETWORK_TCP, &addr.to_string(), 3)
            .await
            .unwrap();
        assert_eq!(conn.remote_addr(), Some(addr));
    }

    #[tokio::test]
    async fn test_refused_dial_is_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let balancer = DirectBalancer::default();
        match balancer.dial_qos(NETWORK_TCP, &addr.to_string(), 0).await {
            Ok(_) => panic!("dial should fail"),
            Err(e) => assert!(matches!(e, InterceptError::DialFailed(_))),
        }
    }

    #[tokio::test]
    async fn test_rejects_non_tcp_network() {
        let balancer = DirectBalancer::default();
        match balancer.dial_qos("udp", "127.0.0.1:53", 0).await {
            Ok(_) => panic!("udp should be rejected"),
            Err(e) => assert!(e.to_string().contains("unsupported network")),
        }
    }
}
