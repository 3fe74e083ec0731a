//! The physical request/response exchange.
//!
//! [`Transport`] is the seam between the execution core and the network. The default
//! implementation, [`ReqwestTransport`], owns a pooled `reqwest::Client`; tests swap in
//! scripted transports.

use crate::call::Call;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::time::Duration;

/// A failure below the HTTP protocol layer.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// An error reported by `reqwest` (DNS, TLS, connect, reset, body read, ...).
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    /// The connection could not be established; the request never reached the server.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The exchange was interrupted after the request may have been sent.
    #[error("connection interrupted: {0}")]
    Interrupted(String),

    /// The per-request timeout elapsed.
    #[error("request timed out")]
    Timeout,
}

impl TransportError {
    /// Returns `true` when the request provably never reached the server.
    ///
    /// Such failures are safe to retry even for non-idempotent calls.
    pub fn is_connect(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_connect(),
            TransportError::Connect(_) => true,
            TransportError::Interrupted(_) | TransportError::Timeout => false,
        }
    }

    /// Returns `true` for per-request timeouts.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_timeout(),
            TransportError::Timeout => true,
            _ => false,
        }
    }
}

/// The streaming body of a response.
///
/// A body is owned by exactly one call. Dropping it releases the underlying
/// connection back to the pool (or closes it), so every exit path of a call
/// releases the body exactly once.
pub struct ResponseBody {
    stream: BoxStream<'static, Result<Bytes, TransportError>>,
}

impl ResponseBody {
    /// Wraps a chunk stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
        }
    }

    /// A body with no content.
    pub fn empty() -> Self {
        Self::from_stream(futures::stream::empty())
    }

    /// A body holding a single in-memory chunk.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self::from_stream(futures::stream::once(async move { Ok(bytes) }))
    }

    /// Reads the next chunk, or `None` at the end of the body.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.stream.next().await
    }

    /// Reads the whole body into memory.
    pub async fn bytes(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody").finish_non_exhaustive()
    }
}

/// The response envelope of one physical exchange.
#[derive(Debug)]
pub struct RawResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The body stream, released when dropped.
    pub body: ResponseBody,
}

impl RawResponse {
    /// Creates a response envelope.
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

/// Performs one physical HTTP exchange.
///
/// Implementations must be safe to share between concurrent calls. Dropping the
/// returned future abandons the exchange.
pub trait Transport: Send + Sync {
    /// Sends `call` once and returns the response head with an unread body.
    fn send<'a>(&'a self, call: &'a Call) -> BoxFuture<'a, Result<RawResponse, TransportError>>;
}

/// The default transport, backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl ReqwestTransport {
    /// Wraps an existing `reqwest::Client`.
    ///
    /// TLS, proxies and connection pooling are whatever that client was built with.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    /// Applies a per-attempt timeout to every request.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(&'a self, call: &'a Call) -> BoxFuture<'a, Result<RawResponse, TransportError>> {
        Box::pin(async move {
            let mut request = self
                .client
                .request(call.method.clone(), call.url.clone())
                .headers(call.headers.clone());

            if let Some(timeout) = self.timeout {
                request = request.timeout(timeout);
            }

            if let Some(body) = &call.body {
                request = request.body(body.clone());
            }

            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = ResponseBody::from_stream(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(TransportError::from)),
            );

            Ok(RawResponse::new(status, headers, body))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_body_collects_all_chunks() {
        let chunks = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let mut body = ResponseBody::from_stream(futures::stream::iter(chunks));
        assert_eq!(body.bytes().await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_body_surfaces_read_error() {
        let chunks = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(TransportError::Interrupted("reset by peer".to_string())),
        ];
        let mut body = ResponseBody::from_stream(futures::stream::iter(chunks));
        assert!(matches!(
            body.bytes().await,
            Err(TransportError::Interrupted(_))
        ));
    }

    #[test]
    fn test_connect_classification() {
        assert!(TransportError::Connect("refused".to_string()).is_connect());
        assert!(!TransportError::Timeout.is_connect());
        assert!(TransportError::Timeout.is_timeout());
        assert!(!TransportError::Interrupted("eof".to_string()).is_connect());
    }
}
