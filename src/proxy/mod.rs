//! CONNECT-intercepting proxy data plane
//!
//! This module provides:
//! - CONNECT tunnel establishment with QoS-aware dialing
//! - Bidirectional piping between hijacked client and outbound sockets
//! - Registries of live client and upstream connections
//! - Plain HTTP forwarding for every other request

pub mod balancer;
pub mod conn;
pub mod dialer;
pub mod egress;
pub mod forward;
pub mod handler;
pub mod intercept;
pub mod qos;
pub mod registry;
pub mod reporter;
pub mod response;
pub mod server;
pub mod sink;
pub mod tunnel;

pub use balancer::DirectBalancer;
pub use dialer::{Balancer, Detour, DialStrategy, Dialer};
pub use egress::EgressDetour;
pub use forward::{PlainForwarder, UpstreamForwarder};
pub use handler::ProxyHandler;
pub use intercept::{Interceptor, TunnelOutcome};
pub use registry::{ConnectionRegistry, RegistryKind};
pub use reporter::{RegistryReporter, RegistryReporterHandle};
pub use server::ProxyServer;
pub use sink::{ResponseSink, StreamSink};
