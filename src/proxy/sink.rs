//! Hijackable response sink
//!
//! While a request is being handled at the HTTP level, replies go through
//! [`ResponseSink::respond`]. A CONNECT handler instead takes the raw socket
//! with [`ResponseSink::hijack`] and speaks on it directly from then on.

use async_trait::async_trait;
use bytes::Bytes;
use http::Response;

use crate::error::{InterceptError, Result};
use crate::proxy::conn::{BoxedConnection, Connection};
use crate::proxy::response::write_response;

#[async_trait]
pub trait ResponseSink: Send {
    /// Writes a complete response on the still HTTP-level connection.
    async fn respond(&mut self, response: Response<Bytes>) -> Result<()>;

    /// Takes exclusive ownership of the underlying socket together with any
    /// bytes already read from it but not yet consumed.
    fn hijack(&mut self) -> Result<BoxedConnection>;
}

/// Sink over a connection owned by the HTTP front end
pub struct StreamSink<S> {
    conn: Option<S>,
}

impl<S: Connection> StreamSink<S> {
    pub fn new(conn: S) -> Self {
        Self { conn: Some(conn) }
    }

    pub fn is_hijacked(&self) -> bool {
        self.conn.is_none()
    }

    /// Gives the connection back if nobody hijacked it.
    pub fn into_inner(self) -> Option<S> {
        self.conn
    }
}

#[async_trait]
impl<S: Connection> ResponseSink for StreamSink<S> {
    async fn respond(&mut self, response: Response<Bytes>) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| InterceptError::Internal("response after hijack".to_string()))?;
        write_response(conn, &response).await?;
        Ok(())
    }

    fn hijack(&mut self) -> Result<BoxedConnection> {
        self.conn
            .take()
            .map(|conn| Box::new(conn) as BoxedConnection)
            .ok_or_else(|| {
                InterceptError::HijackUnsupported("connection already hijacked".to_string())
            })
    }
}
