//! Request dispatcher
//!
//! CONNECT requests are tunneled, everything else goes to the plain
//! forwarder untouched.

use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request};
use tracing::{debug, trace};

use crate::error::Result;
use crate::proxy::forward::PlainForwarder;
use crate::proxy::intercept::Interceptor;
use crate::proxy::sink::ResponseSink;

/// Top-level entry point for parsed proxy requests
pub struct ProxyHandler {
    interceptor: Arc<Interceptor>,
    forwarder: Arc<dyn PlainForwarder>,
}

impl ProxyHandler {
    pub fn new(interceptor: Arc<Interceptor>, forwarder: Arc<dyn PlainForwarder>) -> Self {
        Self {
            interceptor,
            forwarder,
        }
    }

    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    /// Handle an incoming proxy request
    pub async fn handle(&self, req: Request<Bytes>, sink: &mut dyn ResponseSink) -> Result<()> {
        if req.method() == Method::CONNECT {
            trace!("Intercepting CONNECT {}", req.uri());
            let outcome = self.interceptor.intercept(req, sink).await?;
            debug!(?outcome, "Tunnel finished");
            return Ok(());
        }

        trace!("Reverse proxying {} {}", req.method(), req.uri());
        self.forwarder.forward(req, sink).await
    }
}
