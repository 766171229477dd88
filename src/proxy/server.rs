//! Proxy server front end
//!
//! Accepts TCP connections, parses one HTTP/1 request head per connection
//! and hands the request to the [`ProxyHandler`] together with a sink that
//! can be hijacked. Connections are not kept alive between requests.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Method, Request, Uri, Version};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::ProxyServerConfig;
use crate::error::{InterceptError, Result};
use crate::proxy::conn::{Connection, Prebuffered};
use crate::proxy::handler::ProxyHandler;
use crate::proxy::response::text_response;
use crate::proxy::sink::{ResponseSink, StreamSink};

/// Largest request head accepted
pub const MAX_HEAD_LEN: usize = 32 * 1024;
/// Largest plain request body accepted
pub const MAX_BODY_LEN: usize = 8 * 1024 * 1024;
const MAX_HEADERS: usize = 64;

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    pub fn new(config: ProxyServerConfig, handler: Arc<ProxyHandler>) -> Self {
        Self { config, handler }
    }

    /// Run the proxy server
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|_| {
                InterceptError::InvalidConfig(format!(
                    "Invalid proxy server address {}:{}",
                    self.config.host, self.config.port
                ))
            })?;

        let listener = TcpListener::bind(addr).await?;
        info!("Proxy server listening on {}", addr);

        self.serve(listener, shutdown).await
    }

    /// Accepts connections on `listener` until shutdown is signalled.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!("Connection error from {}: {}", client_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender also means shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(stream: TcpStream, handler: Arc<ProxyHandler>) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let mut conn = Prebuffered::new(stream, MAX_HEAD_LEN);

        let request = read_request(&mut conn).await;
        let mut sink = StreamSink::new(conn);
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!("Rejecting request: {}", e);
                if let InterceptError::Io(_) = e {
                    return Err(e);
                }
                sink.respond(text_response(e.status_code(), &e.to_string()))
                    .await?;
                return Ok(());
            }
        };

        handler.handle(request, &mut sink).await
    }
}

/// Reads one request from `reader`, leaving any bytes past it buffered.
///
/// Returns `None` when the client closes before sending anything.
pub async fn read_request<S: Connection>(
    reader: &mut Prebuffered<S>,
) -> Result<Option<Request<Bytes>>> {
    let (head_len, head) = loop {
        if let Some(parsed) = parse_head(reader.buffer())? {
            break parsed;
        }
        if reader.is_full() {
            return Err(InterceptError::InvalidRequest(
                "request head too large".to_string(),
            ));
        }
        if reader.buffer_more().await? == 0 {
            if reader.buffer().is_empty() {
                return Ok(None);
            }
            return Err(InterceptError::InvalidRequest(
                "connection closed mid request".to_string(),
            ));
        }
    };
    reader.discard(head_len);

    let (parts, ()) = head.into_parts();
    if parts.method == Method::CONNECT {
        return Ok(Some(Request::from_parts(parts, Bytes::new())));
    }
    if parts.headers.contains_key(TRANSFER_ENCODING) {
        return Err(InterceptError::LengthRequired);
    }

    let body_len = match parts.headers.get(CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| InterceptError::InvalidRequest("invalid content-length".to_string()))?,
        None => 0,
    };
    if body_len > MAX_BODY_LEN {
        return Err(InterceptError::InvalidRequest(
            "request body too large".to_string(),
        ));
    }

    let body = reader.take_exact(body_len).await?.freeze();
    Ok(Some(Request::from_parts(parts, body)))
}

/// Parses a request head, returning its length once complete.
pub fn parse_head(buf: &[u8]) -> Result<Option<(usize, Request<()>)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req.parse(buf) {
        Ok(httparse::Status::Partial) => return Ok(None),
        Ok(httparse::Status::Complete(len)) => len,
        Err(e) => {
            return Err(InterceptError::InvalidRequest(format!(
                "Invalid HTTP request: {}",
                e
            )))
        }
    };

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| InterceptError::InvalidRequest("invalid method".to_string()))?;
    let path = req
        .path
        .ok_or_else(|| InterceptError::InvalidRequest("missing request target".to_string()))?;
    let uri: Uri = path
        .parse()
        .map_err(|_| InterceptError::InvalidRequest(format!("invalid request target: {}", path)))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .version(version)
        .body(())?;
    let map = request.headers_mut();
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| InterceptError::InvalidRequest(format!("invalid header {}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| InterceptError::InvalidRequest(format!("invalid header {}", header.name)))?;
        map.append(name, value);
    }

    Ok(Some((head_len, request)))
}
