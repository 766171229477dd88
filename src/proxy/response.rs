//! HTTP/1.1 responses written directly onto sockets

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Response, StatusCode};
use tokio::io::{self, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Reply to a successful CONNECT. No body follows.
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Builds a plain-text response with an explicit length.
pub fn text_response(status: StatusCode, message: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(message.to_string()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(CONTENT_LENGTH, message.len().into());
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Serializes `response` as HTTP/1.1 and flushes it.
pub async fn write_response<W>(writer: &mut W, response: &Response<Bytes>) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
    .into_bytes();

    for (name, value) in response.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    writer.write_all(&head).await?;
    writer.write_all(response.body()).await?;
    writer.flush().await
}

/// Writes the CONNECT success status line.
pub async fn respond_ok<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(CONNECTION_ESTABLISHED).await?;
    writer.flush().await
}

/// Writes a 502 carrying `message` as its body.
pub async fn respond_bad_gateway<W>(writer: &mut W, message: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    debug!("Responding BadGateway: {}", message);
    write_response(writer, &text_response(StatusCode::BAD_GATEWAY, message)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_respond_ok_wire_format() {
        let mut socket = tokio_test::io::Builder::new()
            .write(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .build();
        respond_ok(&mut socket).await.unwrap();
    }

    #[tokio::test]
    async fn test_respond_ok_surfaces_write_error() {
        let mut socket = tokio_test::io::Builder::new()
            .write_error(io::ErrorKind::BrokenPipe.into())
            .build();
        let err = respond_ok(&mut socket).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_respond_bad_gateway_carries_message() {
        let mut out = Vec::new();
        respond_bad_gateway(&mut out, "Unable to handle CONNECT request: refused")
            .await
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("content-length: 41\r\n"));
        assert!(text.ends_with("\r\n\r\nUnable to handle CONNECT request: refused"));
    }

    #[tokio::test]
    async fn test_write_response_over_socket_pair() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        let response = text_response(StatusCode::LENGTH_REQUIRED, "length required");

        write_response(&mut writer, &response).await.unwrap();
        drop(writer);

        let mut text = String::new();
        reader.read_to_string(&mut text).await.unwrap();
        assert!(text.starts_with("HTTP/1.1 411 Length Required\r\n"));
        assert!(text.ends_with("length required"));
    }
}
