//! Dialing collaborators and dial strategy selection
//!
//! A tunnel's outbound connection comes from a [`Dialer`]. The base dialer
//! pins the tunnel's QoS class and delegates to the [`Balancer`]; unless
//! direct dialing is forced, it is wrapped by the [`Detour`] collaborator,
//! which owns any fallback and retry policy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::error::Result;
use crate::proxy::conn::BoxedConnection;

/// Network kind requested for every tunnel dial
pub const NETWORK_TCP: &str = "tcp";

/// Produces outbound connections
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedConnection>;
}

/// Upstream selection collaborator
///
/// Chooses which upstream endpoint carries a connection; the proxy only
/// chooses which QoS tier to ask for.
#[async_trait]
pub trait Balancer: Send + Sync {
    async fn dial_qos(&self, network: &str, addr: &str, qos: i64) -> Result<BoxedConnection>;
}

/// Fallback dialing collaborator
pub trait Detour: Send + Sync {
    /// Wraps `base` in a dialer with the same contract that may route the
    /// connection through an alternate transport.
    fn wrap(&self, base: Arc<dyn Dialer>) -> Arc<dyn Dialer>;
}

/// Base dialer: the balancer with one QoS class pinned
pub struct QosDialer {
    balancer: Arc<dyn Balancer>,
    qos: i64,
}

impl QosDialer {
    pub fn new(balancer: Arc<dyn Balancer>, qos: i64) -> Self {
        Self { balancer, qos }
    }

    pub fn qos(&self) -> i64 {
        self.qos
    }
}

#[async_trait]
impl Dialer for QosDialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedConnection> {
        self.balancer.dial_qos(network, addr, self.qos).await
    }
}

/// Chooses between the base dialer and its detour-wrapped form
#[derive(Clone)]
pub struct DialStrategy {
    detour: Option<Arc<dyn Detour>>,
    force_direct: bool,
}

impl DialStrategy {
    pub fn new(detour: Option<Arc<dyn Detour>>, force_direct: bool) -> Self {
        Self {
            detour,
            force_direct,
        }
    }

    /// Always dial directly.
    pub fn direct() -> Self {
        Self::new(None, true)
    }

    pub fn force_direct(&self) -> bool {
        self.force_direct
    }

    pub fn select(&self, base: Arc<dyn Dialer>) -> Arc<dyn Dialer> {
        select_dialer(base, self.force_direct, self.detour.as_deref())
    }
}

/// Returns `base` unwrapped when `force_direct` is set or no detour is
/// configured; otherwise hands `base` to the detour exactly once.
pub fn select_dialer(
    base: Arc<dyn Dialer>,
    force_direct: bool,
    detour: Option<&dyn Detour>,
) -> Arc<dyn Dialer> {
    match detour {
        Some(detour) if !force_direct => {
            trace!("Dialing through detour");
            detour.wrap(base)
        }
        _ => {
            trace!(force_direct, "Dialing directly");
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InterceptError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every dial it sees and hands back an in-memory pipe.
    #[derive(Default)]
    struct RecordingBalancer {
        dials: Mutex<Vec<(String, String, i64)>>,
    }

    #[async_trait]
    impl Balancer for RecordingBalancer {
        async fn dial_qos(&self, network: &str, addr: &str, qos: i64) -> Result<BoxedConnection> {
            self.dials
                .lock()
                .push((network.to_string(), addr.to_string(), qos));
            let (conn, _peer) = tokio::io::duplex(64);
            Ok(Box::new(conn))
        }
    }

    struct FailingBalancer;

    #[async_trait]
    impl Balancer for FailingBalancer {
        async fn dial_qos(&self, _network: &str, addr: &str, _qos: i64) -> Result<BoxedConnection> {
            Err(InterceptError::DialFailed(format!("{} unreachable", addr)))
        }
    }

    /// Detour that counts how often it wraps and how often its dialer runs.
    #[derive(Default)]
    struct CountingDetour {
        wraps: AtomicUsize,
        dials: Arc<AtomicUsize>,
    }

    struct CountingDialer {
        inner: Arc<dyn Dialer>,
        dials: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, network: &str, addr: &str) -> Result<BoxedConnection> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.inner.dial(network, addr).await
        }
    }

    impl Detour for CountingDetour {
        fn wrap(&self, base: Arc<dyn Dialer>) -> Arc<dyn Dialer> {
            self.wraps.fetch_add(1, Ordering::SeqCst);
            Arc::new(CountingDialer {
                inner: base,
                dials: self.dials.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_qos_dialer_pins_qos() {
        let balancer = Arc::new(RecordingBalancer::default());
        let dialer = QosDialer::new(balancer.clone(), 7);

        dialer.dial(NETWORK_TCP, "example.com:443").await.unwrap();

        assert_eq!(
            balancer.dials.lock().as_slice(),
            &[("tcp".to_string(), "example.com:443".to_string(), 7)]
        );
    }

    #[tokio::test]
    async fn test_force_direct_never_wraps() {
        let balancer = Arc::new(RecordingBalancer::default());
        let detour = CountingDetour::default();

        let dialer = select_dialer(Arc::new(QosDialer::new(balancer.clone(), 1)), true, Some(&detour));
        dialer.dial(NETWORK_TCP, "example.com:443").await.unwrap();

        assert_eq!(detour.wraps.load(Ordering::SeqCst), 0);
        assert_eq!(detour.dials.load(Ordering::SeqCst), 0);
        assert_eq!(balancer.dials.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_detour_wraps_once_per_selection() {
        let balancer = Arc::new(RecordingBalancer::default());
        let detour = Arc::new(CountingDetour::default());
        let strategy = DialStrategy::new(Some(detour.clone()), false);

        let dialer = strategy.select(Arc::new(QosDialer::new(balancer.clone(), 2)));
        assert_eq!(detour.wraps.load(Ordering::SeqCst), 1);

        dialer.dial(NETWORK_TCP, "example.com:443").await.unwrap();
        assert_eq!(detour.wraps.load(Ordering::SeqCst), 1);
        assert_eq!(detour.dials.load(Ordering::SeqCst), 1);
        assert_eq!(balancer.dials.lock()[0].2, 2);
    }

    #[tokio::test]
    async fn test_missing_detour_dials_directly() {
        let balancer = Arc::new(RecordingBalancer::default());
        let strategy = DialStrategy::new(None, false);

        let dialer = strategy.select(Arc::new(QosDialer::new(balancer.clone(), 0)));
        dialer.dial(NETWORK_TCP, "example.com:443").await.unwrap();
        assert_eq!(balancer.dials.lock().len(), 1);
        assert!(DialStrategy::direct().force_direct());
    }

    #[tokio::test]
    async fn test_dial_failure_propagates_through_detour() {
        let detour = CountingDetour::default();
        let dialer = select_dialer(
            Arc::new(QosDialer::new(Arc::new(FailingBalancer), 0)),
            false,
            Some(&detour),
        );

        let err = match dialer.dial(NETWORK_TCP, "blocked.example:443").await {
            Ok(_) => panic!("dial should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, InterceptError::DialFailed(_)));
        assert!(err.to_string().contains("blocked.example:443"));
    }
}
