//! Requested quality-of-service resolution

use http::Request;

/// Header carrying the QoS class a client asks for
pub const QOS_HEADER: &str = "X-Flashlight-QOS";

/// Returns the QoS class requested through [`QOS_HEADER`], or `default_qos`
/// when the header is absent or not an integer.
///
/// The value is not range checked; the balancer interprets it.
pub fn resolve_qos<B>(req: &Request<B>, default_qos: i64) -> i64 {
    req.headers()
        .get(QOS_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default_qos)
}
