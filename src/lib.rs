//! Interceptor - CONNECT-intercepting forward proxy
//!
//! Hijacks CONNECT requests, dials the target through a QoS-aware balancer
//! (optionally wrapped by a detour transport) and pipes bytes both ways.
//!
//! ## Features
//!
//! - Per-request QoS class via the `X-Flashlight-QOS` header
//! - Direct or detoured dialing, forced direct on platforms without detour
//! - Client and upstream connection registries with periodic summaries
//! - Plain HTTP forwarding for non-CONNECT requests

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{InterceptError, Result};
