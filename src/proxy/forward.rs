//! Plain HTTP forwarding
//!
//! Requests that are not CONNECT are sent to their origin over a fresh
//! HTTP/1 connection dialed through the balancer, and the collected response
//! is written back on the client's sink.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tracing::{debug, instrument, warn};

use crate::error::{InterceptError, Result};
use crate::proxy::dialer::{Balancer, DialStrategy, QosDialer, NETWORK_TCP};
use crate::proxy::egress::format_tcp_addr;
use crate::proxy::qos::resolve_qos;
use crate::proxy::response::text_response;
use crate::proxy::sink::ResponseSink;

const DEFAULT_HTTP_PORT: u16 = 80;

/// Handles every request the dispatcher does not tunnel
#[async_trait]
pub trait PlainForwarder: Send + Sync {
    async fn forward(&self, req: Request<Bytes>, sink: &mut dyn ResponseSink) -> Result<()>;
}

/// Forwards plain HTTP requests to their origin
pub struct UpstreamForwarder {
    balancer: Arc<dyn Balancer>,
    strategy: DialStrategy,
    min_qos: i64,
    request_timeout: Duration,
}

impl UpstreamForwarder {
    pub fn new(
        balancer: Arc<dyn Balancer>,
        strategy: DialStrategy,
        min_qos: i64,
        request_timeout: Duration,
    ) -> Self {
        Self {
            balancer,
            strategy,
            min_qos,
            request_timeout,
        }
    }

    /// Sends `req` upstream and returns the response with its body collected.
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let (host, port) = origin(&req)?;
        let addr = format_tcp_addr(&host, port);

        let qos = resolve_qos(&req, self.min_qos);
        let dialer = self
            .strategy
            .select(Arc::new(QosDialer::new(self.balancer.clone(), qos)));
        let stream = dialer.dial(NETWORK_TCP, &addr).await?;

        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(path)
            .version(http::Version::HTTP_11);

        // Copy headers, except hop-by-hop headers
        for (name, value) in &parts.headers {
            if !is_hop_by_hop_header(name.as_str()) && name != HOST {
                builder = builder.header(name, value);
            }
        }
        builder = builder.header(HOST, host_header(&host, port));

        let request = builder
            .body(Full::new(body))
            .map_err(|e| InterceptError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| InterceptError::DialFailed(format!("Handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        let response = tokio::time::timeout(self.request_timeout, sender.send_request(request))
            .await
            .map_err(|_| InterceptError::Timeout)??;

        let (mut parts, body) = response.into_parts();
        let body = tokio::time::timeout(self.request_timeout, body.collect())
            .await
            .map_err(|_| InterceptError::Timeout)??
            .to_bytes();

        strip_hop_by_hop(&mut parts.headers);
        parts.headers.insert(CONTENT_LENGTH, body.len().into());
        parts
            .headers
            .insert(http::header::CONNECTION, HeaderValue::from_static("close"));

        Ok(Response::from_parts(parts, body))
    }
}

#[async_trait]
impl PlainForwarder for UpstreamForwarder {
    #[instrument(skip(self, req, sink), fields(method = %req.method(), uri = %req.uri()))]
    async fn forward(&self, req: Request<Bytes>, sink: &mut dyn ResponseSink) -> Result<()> {
        let response = match self.round_trip(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Unable to forward request: {}", e);
                let status = match e {
                    InterceptError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    InterceptError::InvalidRequest(_) | InterceptError::InvalidAddress(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    _ => StatusCode::BAD_GATEWAY,
                };
                text_response(status, &e.to_string())
            }
        };

        sink.respond(response).await
    }
}

/// Host and port the request should be sent to: the absolute-form target,
/// or the `Host` header for origin-form requests.
fn origin<B>(req: &Request<B>) -> Result<(String, u16)> {
    if let Some(host) = req.uri().host() {
        let port = req.uri().port_u16().unwrap_or(DEFAULT_HTTP_PORT);
        return Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port));
    }

    let header = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| InterceptError::InvalidRequest("missing target host".to_string()))?;
    let authority: Uri = format!("http://{}/", header)
        .parse()
        .map_err(|_| InterceptError::InvalidAddress(header.to_string()))?;
    let host = authority
        .host()
        .ok_or_else(|| InterceptError::InvalidAddress(header.to_string()))?;
    Ok((
        host.trim_matches(|c| c == '[' || c == ']').to_string(),
        authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT),
    ))
}

fn host_header(host: &str, port: u16) -> String {
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    if port == DEFAULT_HTTP_PORT {
        host
    } else {
        format!("{}:{}", host, port)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let names: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
