//! CONNECT tunnel establishment
//!
//! Hijacks the client connection, dials the target through the selected
//! dial strategy, and hands both sockets to [`pipe`]. Every connection that
//! gets registered is deregistered and closed on every exit path by its
//! [`ConnectionGuard`](crate::proxy::registry::ConnectionGuard).

use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use tracing::{debug, error, instrument};

use crate::error::{InterceptError, Result};
use crate::proxy::conn::peer_label;
use crate::proxy::dialer::{Balancer, DialStrategy, QosDialer, NETWORK_TCP};
use crate::proxy::qos::resolve_qos;
use crate::proxy::registry::{ConnectionRecord, ConnectionRegistry};
use crate::proxy::response::{respond_bad_gateway, text_response};
use crate::proxy::sink::ResponseSink;
use crate::proxy::tunnel::pipe;

/// Port assumed when a CONNECT target names none
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// What one CONNECT asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    /// Host as supplied by the client
    pub host: String,
    /// `host:port` to dial
    pub addr: String,
    /// QoS class to request from the balancer
    pub qos: i64,
}

impl TunnelRequest {
    pub fn from_request<B>(req: &Request<B>, default_qos: i64) -> Self {
        let host = request_host(req);
        Self {
            addr: host_including_port(&host, DEFAULT_TUNNEL_PORT),
            qos: resolve_qos(req, default_qos),
            host,
        }
    }
}

/// How a tunnel attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelOutcome {
    /// The HTTP layer would not give up the socket
    HijackFailed,
    /// No outbound connection; the client got a 502
    DialFailed,
    /// The 200 reply could not be written
    ResponseFailed,
    /// Bytes were piped until one side finished
    Completed { received: u64 },
}

/// Establishes CONNECT tunnels
pub struct Interceptor {
    balancer: Arc<dyn Balancer>,
    strategy: DialStrategy,
    min_qos: i64,
    client_conns: ConnectionRegistry,
    server_conns: ConnectionRegistry,
}

impl Interceptor {
    pub fn new(
        balancer: Arc<dyn Balancer>,
        strategy: DialStrategy,
        min_qos: i64,
        client_conns: ConnectionRegistry,
        server_conns: ConnectionRegistry,
    ) -> Self {
        Self {
            balancer,
            strategy,
            min_qos,
            client_conns,
            server_conns,
        }
    }

    pub fn client_conns(&self) -> &ConnectionRegistry {
        &self.client_conns
    }

    pub fn server_conns(&self) -> &ConnectionRegistry {
        &self.server_conns
    }

    /// Handles one CONNECT request end to end.
    ///
    /// Failures after the request was accepted are answered on the wire and
    /// reported through the returned [`TunnelOutcome`]. Only a request that
    /// is not CONNECT yields an error.
    #[instrument(skip(self, req, sink), fields(host = ?req.uri().authority()))]
    pub async fn intercept(
        &self,
        req: Request<Bytes>,
        sink: &mut dyn ResponseSink,
    ) -> Result<TunnelOutcome> {
        if req.method() != Method::CONNECT {
            error!("Intercept used for non-CONNECT request: {}", req.method());
            return Err(InterceptError::NotConnect {
                method: req.method().to_string(),
            });
        }

        let mut client = match sink.hijack() {
            Ok(conn) => conn,
            Err(e) => {
                let message = e.to_string();
                debug!("Responding BadGateway: {}", message);
                if let Err(e) = sink
                    .respond(text_response(StatusCode::BAD_GATEWAY, &message))
                    .await
                {
                    debug!("Unable to respond BadGateway: {}", e);
                }
                return Ok(TunnelOutcome::HijackFailed);
            }
        };

        let tunnel = TunnelRequest::from_request(&req, self.min_qos);
        let client_guard = self
            .client_conns
            .track(ConnectionRecord::new(tunnel.host.clone(), peer_label(&client)));

        let base = Arc::new(QosDialer::new(self.balancer.clone(), tunnel.qos));
        let dialer = self.strategy.select(base);

        let outbound = match dialer.dial(NETWORK_TCP, &tunnel.addr).await {
            Ok(conn) => conn,
            Err(e) => {
                let message = format!("Unable to handle CONNECT request: {}", e);
                if let Err(e) = respond_bad_gateway(&mut client, &message).await {
                    debug!("Unable to respond BadGateway: {}", e);
                }
                return Ok(TunnelOutcome::DialFailed);
            }
        };

        let outbound_guard = self
            .server_conns
            .track(ConnectionRecord::new(tunnel.addr.clone(), peer_label(&outbound)));

        let outcome = match pipe(
            client,
            outbound,
            &req,
            client_guard.close_signal(),
            outbound_guard.close_signal(),
        )
        .await
        {
            Ok(received) => TunnelOutcome::Completed { received },
            Err(_) => TunnelOutcome::ResponseFailed,
        };

        drop(outbound_guard);
        drop(client_guard);
        Ok(outcome)
    }
}

/// Host the client asked to tunnel to: the authority-form target, or the
/// `Host` header when the target carries none.
pub fn request_host<B>(req: &Request<B>) -> String {
    req.uri()
        .authority()
        .map(|authority| authority.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

/// Returns `host` unchanged when it already names a port, otherwise appends
/// `default_port`. Bare IPv6 literals are bracketed.
pub fn host_including_port(host: &str, default_port: u16) -> String {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((_, tail)) if tail.len() > 1 && tail.starts_with(':') => host.to_string(),
            _ => format!("{}:{}", host.trim_end_matches(':'), default_port),
        };
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && !port.is_empty() => host.to_string(),
        Some((name, "")) if !name.contains(':') => format!("{}{}", host, default_port),
        Some(_) => format!("[{}]:{}", host, default_port),
        None => format!("{}:{}", host, default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::conn::{BoxedConnection, Prebuffered};
    use crate::proxy::dialer::{Detour, Dialer};
    use crate::proxy::registry::RegistryKind;
    use crate::proxy::sink::StreamSink;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::Response;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    /// Balancer handing out in-memory pipes; the far ends go to the test.
    struct PipeBalancer {
        dials: Mutex<Vec<(String, i64)>>,
        upstreams: mpsc::UnboundedSender<DuplexStream>,
    }

    impl PipeBalancer {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    dials: Mutex::new(Vec::new()),
                    upstreams: tx,
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl Balancer for PipeBalancer {
        async fn dial_qos(&self, _network: &str, addr: &str, qos: i64) -> Result<BoxedConnection> {
            self.dials.lock().push((addr.to_string(), qos));
            let (conn, far) = tokio::io::duplex(1024);
            let _ = self.upstreams.send(far);
            Ok(Box::new(conn))
        }
    }

    struct FailingBalancer;

    #[async_trait]
    impl Balancer for FailingBalancer {
        async fn dial_qos(&self, _network: &str, _addr: &str, _qos: i64) -> Result<BoxedConnection> {
            Err(InterceptError::DialFailed("connection refused".to_string()))
        }
    }

    /// Failing balancer that notes how many sockets each registry held while
    /// the dial was in flight.
    struct RegistryWatchingBalancer {
        client_conns: ConnectionRegistry,
        server_conns: ConnectionRegistry,
        seen: Mutex<Option<(usize, usize)>>,
    }

    #[async_trait]
    impl Balancer for RegistryWatchingBalancer {
        async fn dial_qos(&self, _network: &str, _addr: &str, _qos: i64) -> Result<BoxedConnection> {
            *self.seen.lock() = Some((self.client_conns.len(), self.server_conns.len()));
            Err(InterceptError::DialFailed("connection refused".to_string()))
        }
    }

    /// Sink whose connection cannot be hijacked; records what it was asked to send.
    #[derive(Default)]
    struct UnhijackableSink {
        responses: Vec<Response<Bytes>>,
    }

    #[async_trait]
    impl ResponseSink for UnhijackableSink {
        async fn respond(&mut self, response: Response<Bytes>) -> Result<()> {
            self.responses.push(response);
            Ok(())
        }

        fn hijack(&mut self) -> Result<BoxedConnection> {
            Err(InterceptError::HijackUnsupported(
                "not supported".to_string(),
            ))
        }
    }

    #[derive(Default)]
    struct CountingDetour {
        wraps: AtomicUsize,
    }

    impl Detour for CountingDetour {
        fn wrap(&self, base: Arc<dyn Dialer>) -> Arc<dyn Dialer> {
            self.wraps.fetch_add(1, Ordering::SeqCst);
            base
        }
    }

    fn interceptor(balancer: Arc<dyn Balancer>, strategy: DialStrategy) -> Interceptor {
        Interceptor::new(
            balancer,
            strategy,
            0,
            ConnectionRegistry::new(RegistryKind::Client),
            ConnectionRegistry::new(RegistryKind::Server),
        )
    }

    fn connect(target: &str, qos: Option<&str>) -> Request<Bytes> {
        let mut builder = Request::connect(target);
        if let Some(qos) = qos {
            builder = builder.header(crate::proxy::qos::QOS_HEADER, qos);
        }
        builder.body(Bytes::new()).unwrap()
    }

    fn client_sink() -> (StreamSink<Prebuffered<DuplexStream>>, DuplexStream) {
        let (conn, peer) = tokio::io::duplex(1024);
        (StreamSink::new(Prebuffered::new(conn, 1024)), peer)
    }

    #[test]
    fn test_host_including_port() {
        assert_eq!(host_including_port("example.com", 443), "example.com:443");
        assert_eq!(host_including_port("example.com:8443", 443), "example.com:8443");
        assert_eq!(host_including_port("example.com:", 443), "example.com:443");
        assert_eq!(host_including_port("10.0.0.1", 443), "10.0.0.1:443");
        assert_eq!(host_including_port("[::1]:8443", 443), "[::1]:8443");
        assert_eq!(host_including_port("[::1]", 443), "[::1]:443");
        assert_eq!(host_including_port("::1", 443), "[::1]:443");
    }

    #[test]
    fn test_tunnel_request_from_request() {
        let tunnel = TunnelRequest::from_request(&connect("example.com", Some("7")), 1);
        assert_eq!(
            tunnel,
            TunnelRequest {
                host: "example.com".to_string(),
                addr: "example.com:443".to_string(),
                qos: 7,
            }
        );

        let tunnel = TunnelRequest::from_request(&connect("example.com:8443", None), 1);
        assert_eq!(tunnel.addr, "example.com:8443");
        assert_eq!(tunnel.qos, 1);

        let tunnel = TunnelRequest::from_request(&connect("example.com", Some("99999999999")), 1);
        assert_eq!(tunnel.qos, 99_999_999_999);
    }

    #[tokio::test]
    async fn test_successful_tunnel_registers_and_releases_both_sockets() {
        let (balancer, mut upstreams) = PipeBalancer::new();
        let interceptor = Arc::new(interceptor(balancer.clone(), DialStrategy::direct()));
        let (mut sink, mut client_peer) = client_sink();

        let task = tokio::spawn({
            let interceptor = interceptor.clone();
            async move {
                interceptor
                    .intercept(connect("example.com", Some("7")), &mut sink)
                    .await
            }
        });

        let mut reply = vec![0u8; 39];
        client_peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        let mut upstream = upstreams.recv().await.unwrap();
        assert_eq!(
            balancer.dials.lock().as_slice(),
            &[("example.com:443".to_string(), 7)]
        );

        // Both sockets are tracked while bytes flow.
        client_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(interceptor.client_conns().len(), 1);
        assert_eq!(interceptor.server_conns().len(), 1);

        upstream.write_all(b"world").await.unwrap();
        drop(upstream);

        let outcome = timeout(Duration::from_secs(1), task)
            .await
            .expect("intercept did not finish")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, TunnelOutcome::Completed { received: 5 });
        assert!(interceptor.client_conns().is_empty());
        assert!(interceptor.server_conns().is_empty());

        let mut rest = Vec::new();
        timeout(Duration::from_secs(1), client_peer.read_to_end(&mut rest))
            .await
            .expect("client socket was not closed")
            .unwrap();
        assert_eq!(rest, b"world");
    }

    #[tokio::test]
    async fn test_dial_failure_answers_bad_gateway_on_hijacked_socket() {
        let client_conns = ConnectionRegistry::new(RegistryKind::Client);
        let server_conns = ConnectionRegistry::new(RegistryKind::Server);
        let balancer = Arc::new(RegistryWatchingBalancer {
            client_conns: client_conns.clone(),
            server_conns: server_conns.clone(),
            seen: Mutex::new(None),
        });
        let interceptor = Interceptor::new(
            balancer.clone(),
            DialStrategy::direct(),
            0,
            client_conns,
            server_conns,
        );
        let (mut sink, mut client_peer) = client_sink();

        let outcome = interceptor
            .intercept(connect("blocked.example:443", None), &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome, TunnelOutcome::DialFailed);
        assert!(sink.is_hijacked());

        // The client was tracked during the dial; no outbound socket ever was.
        assert_eq!(*balancer.seen.lock(), Some((1, 0)));

        let mut text = String::new();
        timeout(Duration::from_secs(1), client_peer.read_to_string(&mut text))
            .await
            .expect("client socket was not closed")
            .unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.ends_with("Unable to handle CONNECT request: Dial failed: connection refused"));

        assert!(interceptor.client_conns().is_empty());
        assert!(interceptor.server_conns().is_empty());
    }

    #[tokio::test]
    async fn test_hijack_failure_answers_on_http_sink() {
        let interceptor = interceptor(Arc::new(FailingBalancer), DialStrategy::direct());
        let mut sink = UnhijackableSink::default();

        let outcome = interceptor
            .intercept(connect("example.com:443", None), &mut sink)
            .await
            .unwrap();
        assert_eq!(outcome, TunnelOutcome::HijackFailed);
        assert_eq!(sink.responses.len(), 1);
        assert_eq!(sink.responses[0].status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            sink.responses[0].body().as_ref(),
            b"Unable to hijack connection: not supported"
        );
        assert!(interceptor.client_conns().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reply_still_releases_both_sockets() {
        let (balancer, mut upstreams) = PipeBalancer::new();
        let interceptor = interceptor(balancer, DialStrategy::direct());
        let (mut sink, client_peer) = client_sink();

        // Nobody is left to read the reply.
        drop(client_peer);

        let outcome = timeout(
            Duration::from_secs(1),
            interceptor.intercept(connect("example.com:443", None), &mut sink),
        )
        .await
        .expect("intercept did not finish")
        .unwrap();
        assert_eq!(outcome, TunnelOutcome::ResponseFailed);
        assert!(upstreams.recv().await.is_some());
        assert!(interceptor.client_conns().is_empty());
        assert!(interceptor.server_conns().is_empty());
    }

    #[tokio::test]
    async fn test_detour_wraps_once_per_tunnel() {
        let (balancer, _upstreams) = PipeBalancer::new();
        let detour = Arc::new(CountingDetour::default());
        let detoured = interceptor(
            Arc::new(FailingBalancer),
            DialStrategy::new(Some(detour.clone()), false),
        );
        let direct = interceptor(balancer, DialStrategy::new(Some(detour.clone()), true));

        let (mut sink, _peer) = client_sink();
        detoured
            .intercept(connect("example.com:443", None), &mut sink)
            .await
            .unwrap();
        assert_eq!(detour.wraps.load(Ordering::SeqCst), 1);

        let (mut sink, peer) = client_sink();
        drop(peer);
        direct
            .intercept(connect("example.com:443", None), &mut sink)
            .await
            .unwrap();
        assert_eq!(detour.wraps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_connect_request_is_rejected() {
        let interceptor = interceptor(Arc::new(FailingBalancer), DialStrategy::direct());
        let (mut sink, _peer) = client_sink();

        let req = Request::get("http://example.com/").body(Bytes::new()).unwrap();
        let err = interceptor.intercept(req, &mut sink).await.unwrap_err();
        assert!(matches!(err, InterceptError::NotConnect { .. }));
        assert!(!sink.is_hijacked());
    }
}
