//! Bidirectional piping for established CONNECT tunnels
//!
//! The client→outbound direction starts before the `200` reply is written so
//! that bytes the client sends early are forwarded without delay. The task
//! running that direction closes the client socket once its copy ends, but
//! only after the reply has been attempted, which is enforced with a one-shot
//! signal.
//!
//! Half-close is not preserved: once either direction finishes, the client
//! socket is closed in full. Most clients close both directions together.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Request;
use parking_lot::Mutex;
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tracing::{debug, error, instrument, trace};

use crate::error::Result;
use crate::proxy::registry::CloseSignal;
use crate::proxy::response::respond_ok;

/// Client socket shared by both pipe directions.
///
/// Any handle can [`close`](ClientSocket::close) it, which drops the
/// underlying connection for every handle. Reads on a closed socket return
/// EOF and writes fail with `NotConnected`.
struct ClientSocket<C> {
    inner: Arc<Mutex<Option<C>>>,
}

impl<C> ClientSocket<C> {
    fn new(conn: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(conn))),
        }
    }

    fn handle(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }

    fn close(&self) {
        // Drop outside the lock.
        let conn = self.inner.lock().take();
        drop(conn);
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for ClientSocket<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.inner.lock().as_mut() {
            Some(conn) => Pin::new(conn).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for ClientSocket<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.inner.lock().as_mut() {
            Some(conn) => Pin::new(conn).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.lock().as_mut() {
            Some(conn) => Pin::new(conn).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.inner.lock().as_mut() {
            Some(conn) => Pin::new(conn).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Replies `200 Connection Established` on `client` and relays bytes between
/// `client` and `outbound` until one side is done.
///
/// Returns the number of bytes relayed outbound→client once that direction
/// ends, or the write error if the reply could not be sent (in which case
/// that direction never starts). The client→outbound direction runs on its
/// own task and may finish after this returns; it ends on EOF, on error, or
/// when either close signal fires, and then closes the client socket.
#[instrument(skip_all, fields(target = %req.uri()))]
pub async fn pipe<C, S, B>(
    client: C,
    outbound: S,
    req: &Request<B>,
    client_closed: CloseSignal,
    outbound_closed: CloseSignal,
) -> Result<u64>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut client_write = ClientSocket::new(client);
    let mut client_read = client_write.handle();
    let (mut outbound_read, mut outbound_write) = io::split(outbound);

    let (response_sent_tx, response_sent_rx) = oneshot::channel::<()>();
    let (client_done_tx, mut client_done_rx) = oneshot::channel::<()>();

    // Start piping from client to upstream
    let mut task_client_closed = client_closed.clone();
    let mut task_outbound_closed = outbound_closed;
    tokio::spawn(async move {
        let uploaded = tokio::select! {
            result = io::copy(&mut client_read, &mut outbound_write) => result,
            _ = task_client_closed.closed() => Ok(0),
            _ = task_outbound_closed.closed() => Ok(0),
        };
        match uploaded {
            Ok(n) => trace!(bytes = n, "Client to upstream copy ended"),
            Err(e) => debug!("Client to upstream copy ended: {}", e),
        }

        // Never tear down the client socket before the reply was attempted.
        let _ = response_sent_rx.await;
        client_read.close();
        let _ = client_done_tx.send(());
    });

    let responded = respond_ok(&mut client_write).await;
    let _ = response_sent_tx.send(());
    if let Err(e) = responded {
        error!("Unable to respond OK: {}", e);
        return Err(e.into());
    }

    let mut client_closed = client_closed;
    let downloaded = tokio::select! {
        result = io::copy(&mut outbound_read, &mut client_write) => result,
        _ = &mut client_done_rx => Ok(0),
        _ = client_closed.closed() => Ok(0),
    };

    match downloaded {
        Ok(n) => {
            debug!(bytes_received = n, "Tunnel closed");
            Ok(n)
        }
        Err(e) => {
            debug!("Upstream to client copy ended: {}", e);
            Ok(0)
        }
    }
}
