//! Socket abstraction shared by hijacked client connections and dialed
//! upstream connections.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// Initial capacity for the request head buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// A live byte stream owned by the proxy.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Remote address of the underlying socket, if it can be determined.
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Type-erased connection returned by dialers and hijacks.
pub type BoxedConnection = Box<dyn Connection>;

impl Connection for TcpStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

impl Connection for DuplexStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Connection for BoxedConnection {
    fn remote_addr(&self) -> Option<SocketAddr> {
        (**self).remote_addr()
    }
}

/// Renders a best-effort remote address, empty when unavailable.
pub fn peer_label<C: Connection + ?Sized>(conn: &C) -> String {
    conn.remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default()
}

/// A connection with bytes already read off the wire in front of it.
///
/// The HTTP front end reads the request head through this wrapper; whatever
/// the client sent past the head (e.g. a TLS ClientHello pipelined after
/// CONNECT) stays buffered and is replayed to the next reader.
pub struct Prebuffered<S> {
    inner: S,
    buf: BytesMut,
    max_len: usize,
}

impl<S: Connection> Prebuffered<S> {
    pub fn new(inner: S, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    /// Discards `n` bytes from the front of the buffer.
    pub fn discard(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    /// Moves the first `n` buffered bytes out, reading more as needed.
    pub async fn take_exact(&mut self, n: usize) -> io::Result<BytesMut> {
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            if self.buf.is_empty() {
                let read = (&mut self.inner).read_buf(&mut self.buf).await?;
                if read == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
            }
            let chunk = self.buf.split_to((n - out.len()).min(self.buf.len()));
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Buffers more data from the inner stream, up to the size limit.
    pub async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        (&mut self.inner).take(max as u64).read_buf(&mut self.buf).await
    }
}

impl<S: Connection> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

impl<S: Connection> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: Connection> Connection for Prebuffered<S> {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr()
    }
}
