//! Egress-proxy fallback dialing
//!
//! [`EgressDetour`] is the default detour collaborator: it lets the wrapped
//! dialer try first and, when that fails, reaches the target through a
//! configured HTTP CONNECT or SOCKS5 egress proxy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

use crate::config::{EgressProxyConfig, EgressProxyProtocol};
use crate::error::{InterceptError, Result};
use crate::proxy::conn::{BoxedConnection, Prebuffered};
use crate::proxy::dialer::{Detour, Dialer};

/// Largest CONNECT reply head accepted from an egress proxy
const MAX_REPLY_HEAD: usize = 8 * 1024;

/// Detour that falls back to an egress proxy
pub struct EgressDetour {
    egress: Arc<EgressProxyConfig>,
    connect_timeout: Duration,
}

impl EgressDetour {
    pub fn new(egress: EgressProxyConfig, connect_timeout: Duration) -> Self {
        Self {
            egress: Arc::new(egress),
            connect_timeout,
        }
    }
}

impl Detour for EgressDetour {
    fn wrap(&self, base: Arc<dyn Dialer>) -> Arc<dyn Dialer> {
        Arc::new(EgressFallbackDialer {
            base,
            egress: self.egress.clone(),
            connect_timeout: self.connect_timeout,
        })
    }
}

struct EgressFallbackDialer {
    base: Arc<dyn Dialer>,
    egress: Arc<EgressProxyConfig>,
    connect_timeout: Duration,
}

#[async_trait]
impl Dialer for EgressFallbackDialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedConnection> {
        let direct_err = match self.base.dial(network, addr).await {
            Ok(conn) => return Ok(conn),
            Err(e) => e,
        };

        warn!(
            "Direct dial to {} failed ({}), detouring through {}:{}",
            addr, direct_err, self.egress.host, self.egress.port
        );

        tokio::time::timeout(self.connect_timeout, dial_via_egress(&self.egress, addr))
            .await
            .map_err(|_| InterceptError::Timeout)?
    }
}

/// Opens a connection to `addr` through `egress`.
pub async fn dial_via_egress(egress: &EgressProxyConfig, addr: &str) -> Result<BoxedConnection> {
    let (host, port) = split_target(addr)?;
    let proxy_addr = format_tcp_addr(&egress.host, egress.port);
    debug!("Dialing {} through egress proxy {}", addr, proxy_addr);

    let socket = TcpStream::connect(&proxy_addr).await.map_err(|e| {
        InterceptError::DialFailed(format!("egress proxy {} unreachable: {}", proxy_addr, e))
    })?;

    let handshake = match egress.protocol {
        EgressProxyProtocol::Http => http_connect(socket, egress, &host, port).await,
        EgressProxyProtocol::Socks5 => socks5_connect(socket, egress, &host, port).await,
    };

    handshake.map_err(|e| {
        InterceptError::DialFailed(format!(
            "egress proxy {} could not reach {}: {:#}",
            proxy_addr, addr, e
        ))
    })
}

async fn http_connect(
    socket: TcpStream,
    egress: &EgressProxyConfig,
    host: &str,
    port: u16,
) -> anyhow::Result<BoxedConnection> {
    let authority = format_tcp_addr(host, port);
    let mut head = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority);
    if let Some(credentials) = basic_credentials(egress) {
        head.push_str("Proxy-Authorization: Basic ");
        head.push_str(&credentials);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let mut conn = Prebuffered::new(socket, MAX_REPLY_HEAD);
    conn.write_all(head.as_bytes())
        .await
        .context("sending CONNECT")?;

    // Bytes the proxy sends past its reply head stay buffered for the tunnel.
    let (head_len, status) = loop {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut reply = httparse::Response::new(&mut headers);
        if let httparse::Status::Complete(len) = reply
            .parse(conn.buffer())
            .context("malformed CONNECT reply")?
        {
            break (len, reply.code.unwrap_or_default());
        }
        if conn.is_full() {
            bail!("CONNECT reply head too large");
        }
        if conn.buffer_more().await.context("reading CONNECT reply")? == 0 {
            bail!("egress proxy closed during CONNECT");
        }
    };

    if status != 200 {
        bail!("CONNECT rejected with status {}", status);
    }
    conn.discard(head_len);

    Ok(Box::new(conn))
}

async fn socks5_connect(
    socket: TcpStream,
    egress: &EgressProxyConfig,
    host: &str,
    port: u16,
) -> anyhow::Result<BoxedConnection> {
    let stream = match (&egress.username, &egress.password) {
        (Some(username), Some(password)) => {
            Socks5Stream::connect_with_password_and_socket(socket, (host, port), username, password)
                .await
        }
        _ => Socks5Stream::connect_with_socket(socket, (host, port)).await,
    }
    .context("SOCKS5 handshake")?;

    Ok(Box::new(stream.into_inner()))
}

/// Base64 `user:password` for `Proxy-Authorization`, if a user is configured.
fn basic_credentials(egress: &EgressProxyConfig) -> Option<String> {
    let username = egress.username.as_deref()?;
    let password = egress.password.as_deref().unwrap_or_default();
    Some(BASE64.encode(format!("{}:{}", username, password)))
}

/// Splits `host:port`, unbracketing IPv6 literals.
pub(crate) fn split_target(addr: &str) -> Result<(String, u16)> {
    let invalid = |reason: &str| InterceptError::InvalidAddress(format!("{}: {}", addr, reason));

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(|| invalid("unclosed bracket"))?,
        None if host.contains(':') => return Err(invalid("IPv6 literal must be bracketed")),
        None => host,
    };
    if host.is_empty() {
        return Err(invalid("missing host"));
    }

    Ok((host.to_string(), port))
}

/// Joins host and port, bracketing bare IPv6 literals.
pub(crate) fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
