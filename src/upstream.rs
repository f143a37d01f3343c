//! The upstream inference server seam.
//!
//! The pipeline talks to the upstream only through the [`Upstream`] trait,
//! so tests can script chunk timing and failures in-process. [`HttpUpstream`]
//! is the production implementation on top of reqwest.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, HeaderName};
use reqwest::{Client, StatusCode};
use tokio_stream::StreamExt;
use tracing::{debug, instrument};

use crate::{HuginnError, Result};

/// Default upstream address: a local vLLM-compatible server.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8001";

/// Response body as a lazy, finite, non-restartable sequence of chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Hop-by-hop headers (RFC 9110 section 7.6.1). They describe the inbound
/// connection and are never relayed.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether an inbound request header is relayed upstream.
///
/// `host` and `content-length` are dropped as well; reqwest derives both
/// from the target URL and the buffered body.
fn is_relayed(name: &HeaderName) -> bool {
    *name != HOST && *name != CONTENT_LENGTH && !HOP_BY_HOP.contains(&name.as_str())
}

/// An inbound completion request, relayed byte-for-byte.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// Path and query below the upstream base URL, e.g.
    /// `/v1/chat/completions?api-version=2024`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    pub fn new(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Copy the end-to-end headers of an inbound request.
    ///
    /// Hop-by-hop headers, `host` and `content-length` are left behind.
    /// Repeated headers keep every value.
    pub fn with_headers(mut self, headers: &HeaderMap) -> Self {
        for (name, value) in headers {
            if is_relayed(name) {
                self.headers.append(name.clone(), value.clone());
            }
        }
        self
    }

    /// Whether the payload asks for a streamed response (`"stream": true`).
    ///
    /// Unparseable payloads count as non-streaming; the upstream decides
    /// what to do with them.
    pub fn wants_stream(&self) -> bool {
        serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
            .unwrap_or(false)
    }
}

/// Status line and headers of an upstream response, plus its body stream.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl UpstreamResponse {
    /// Whether the upstream answered with server-sent events.
    pub fn is_event_stream(&self) -> bool {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Performs the actual upstream call.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` and return once response headers are in.
    ///
    /// Transport failures and timeouts are errors; a non-2xx status is not.
    async fn send(&self, request: &ForwardRequest) -> Result<UpstreamResponse>;
}

/// Connection settings for [`HttpUpstream`].
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// TCP/TLS connect bound.
    pub connect_timeout: Duration,
    /// Longest allowed gap between two body chunks.
    pub read_timeout: Duration,
    /// Bound on sending the request and receiving response headers.
    pub write_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(60),
        }
    }
}

impl UpstreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// reqwest-backed [`Upstream`].
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    http: Client,
    config: UpstreamConfig,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| HuginnError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_http_client(http, config))
    }

    /// Use a preconfigured client. `config.connect_timeout` is then the
    /// client's business.
    pub fn with_http_client(http: Client, mut config: UpstreamConfig) -> Self {
        let trimmed = config.base_url.trim_end_matches('/').len();
        config.base_url.truncate(trimmed);
        Self { http, config }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    #[instrument(name = "upstream.send", skip(self, request), fields(path = %request.path))]
    async fn send(&self, request: &ForwardRequest) -> Result<UpstreamResponse> {
        let url = format!("{}{}", self.config.base_url, request.path);

        let call = self
            .http
            .post(&url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send();
        let response = tokio::time::timeout(self.config.write_timeout, call)
            .await
            .map_err(|_| HuginnError::Timeout("write"))??;

        let status = response.status();
        let headers = response.headers().clone();
        debug!(status = status.as_u16(), "upstream responded");

        let body = response
            .bytes_stream()
            .timeout(self.config.read_timeout)
            .map(|item| match item {
                Ok(chunk) => chunk.map_err(HuginnError::from),
                Err(_) => Err(HuginnError::Timeout("read")),
            });

        Ok(UpstreamResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::{AUTHORIZATION, CONNECTION, HeaderValue, TRANSFER_ENCODING};

    use super::*;

    #[test]
    fn end_to_end_headers_are_relayed() {
        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-test"));
        inbound.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        inbound.insert("x-request-id", HeaderValue::from_static("abc"));
        inbound.append("x-tag", HeaderValue::from_static("a"));
        inbound.append("x-tag", HeaderValue::from_static("b"));
        inbound.insert(HOST, HeaderValue::from_static("proxy.local"));
        inbound.insert(CONTENT_LENGTH, HeaderValue::from_static("2"));
        inbound.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        inbound.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        inbound.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let request = ForwardRequest::new("/v1/chat/completions", "{}").with_headers(&inbound);
        assert_eq!(request.headers[AUTHORIZATION], "Bearer sk-test");
        assert_eq!(request.headers["x-request-id"], "abc");
        assert_eq!(request.headers.get_all("x-tag").iter().count(), 2);
        for dropped in ["host", "content-length", "connection", "keep-alive", "transfer-encoding"] {
            assert!(request.headers.get(dropped).is_none(), "{dropped}");
        }
        assert_eq!(request.headers.len(), 5);
    }

    #[test]
    fn stream_flag_is_read_from_payload() {
        assert!(ForwardRequest::new("/", r#"{"stream": true}"#).wants_stream());
        assert!(!ForwardRequest::new("/", r#"{"stream": false}"#).wants_stream());
        assert!(!ForwardRequest::new("/", r#"{"messages": []}"#).wants_stream());
        assert!(!ForwardRequest::new("/", "not json").wants_stream());
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let upstream = HttpUpstream::new(UpstreamConfig::new("http://localhost:9000/")).unwrap();
        assert_eq!(upstream.base_url(), "http://localhost:9000");
    }
}
