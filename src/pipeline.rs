//! The forwarding pipeline: one request's lifecycle from admission to
//! finalization.
//!
//! ```text
//! received ──► queued ──► running ──┬──► streaming ──► completed
//!                                   ├──► completed
//!                                   └──► failed
//! ```
//!
//! [`Forwarder::forward`] acquires a [`Permit`], dispatches to the
//! [`Upstream`], and either buffers the body (non-streaming) or hands back a
//! [`RelayStream`] that forwards chunks as they arrive. The permit travels
//! with the response, so the request is finalized exactly once on every
//! exit path, including the caller dropping the future or the stream.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, TRANSFER_ENCODING};
use serde::Deserialize;
use tokio::time::{Instant, Sleep};
use tracing::{Span, debug, instrument, warn};

use crate::admission::{AdmissionController, Permit};
use crate::recorder::{Recorder, RequestStatus};
use crate::upstream::{BodyStream, ForwardRequest, Upstream};
use crate::{HuginnError, Result};

/// Longest partial SSE line kept while scanning for usage.
const MAX_PENDING_LINE: usize = 1 << 20;

// ============================================================================
// Usage accounting
// ============================================================================

/// Token usage as reported by an OpenAI-compatible upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Deserialize)]
struct UsageEnvelope {
    usage: Option<Usage>,
}

/// Read the `usage` object from a JSON response body.
///
/// Missing, null or malformed usage (including negative counts) yields `None`.
pub fn parse_usage(body: &[u8]) -> Option<Usage> {
    serde_json::from_slice::<UsageEnvelope>(body).ok()?.usage
}

/// Incremental scanner for `usage` in server-sent events.
///
/// Chunk boundaries may split lines anywhere, so partial lines are carried
/// over. The last event carrying usage wins.
#[derive(Debug, Default)]
struct UsageScanner {
    pending: Vec<u8>,
}

impl UsageScanner {
    fn feed(&mut self, chunk: &[u8]) -> Option<Usage> {
        self.pending.extend_from_slice(chunk);
        let mut found = None;
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            if let Some(usage) = usage_from_line(&line) {
                found = Some(usage);
            }
        }
        if self.pending.len() > MAX_PENDING_LINE {
            self.pending.clear();
        }
        found
    }

    /// Flush a trailing line that had no newline.
    fn finish(&mut self) -> Option<Usage> {
        let line = std::mem::take(&mut self.pending);
        usage_from_line(&line)
    }
}

fn usage_from_line(line: &[u8]) -> Option<Usage> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let payload = line.strip_prefix(b"data:")?.trim_ascii_start();
    if payload == b"[DONE]" {
        return None;
    }
    parse_usage(payload)
}

// ============================================================================
// Forwarder
// ============================================================================

/// Response handed back to the HTTP layer.
pub struct ForwardResponse {
    pub status: StatusCode,
    /// Upstream headers minus hop-by-hop ones.
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

/// Either a fully buffered body or a live relay of upstream chunks.
pub enum ResponseBody {
    Complete(Bytes),
    Stream(RelayStream),
}

impl fmt::Debug for ForwardResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            ResponseBody::Complete(bytes) => format!("Complete({} bytes)", bytes.len()),
            ResponseBody::Stream(_) => "Stream".to_string(),
        };
        f.debug_struct("ForwardResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &body)
            .finish()
    }
}

/// Admission-controlled relay to one upstream.
///
/// Cloning is cheap; clones share the slot pool and the recorder.
#[derive(Clone)]
pub struct Forwarder {
    controller: AdmissionController,
    upstream: Arc<dyn Upstream>,
    queue_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
}

impl Forwarder {
    /// Assemble a forwarder. Most callers go through
    /// [`Huginn::builder()`](crate::Huginn::builder).
    pub fn new(controller: AdmissionController, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            controller,
            upstream,
            queue_timeout: None,
            request_timeout: None,
        }
    }

    /// Give up on admission after this long.
    pub fn queue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Deadline from admission to the end of the response body.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn recorder(&self) -> &Arc<Recorder> {
        self.controller.recorder()
    }

    pub fn controller(&self) -> &AdmissionController {
        &self.controller
    }

    /// Forward one request and relay its response.
    ///
    /// Upstream failures are finalized as `error` before the error is
    /// returned. Non-2xx responses are not errors: they are relayed as-is and
    /// finalized as `error`.
    #[instrument(skip_all, fields(path = %request.path, stream = tracing::field::Empty))]
    pub async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse> {
        let mut permit = self.controller.acquire(self.queue_timeout).await?;
        let deadline = self.request_timeout.map(|t| permit.admitted_at() + t);

        let response = match within(deadline, self.upstream.send(&request)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "upstream request failed");
                permit.finish(err.status());
                return Err(err);
            }
        };

        let status = response.status;
        let headers = relay_headers(&response.headers);
        let streaming = response.is_event_stream()
            || (!response.headers.contains_key(CONTENT_TYPE) && request.wants_stream());
        Span::current().record("stream", streaming);

        if streaming && status.is_success() {
            let body = RelayStream::new(response.body, permit, deadline);
            return Ok(ForwardResponse {
                status,
                headers,
                body: ResponseBody::Stream(body),
            });
        }

        let body = match within(deadline, collect(response.body)).await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "reading upstream body failed");
                permit.finish(err.status());
                return Err(err);
            }
        };

        if status.is_success() {
            if let Some(usage) = parse_usage(&body) {
                permit.set_usage(usage.prompt_tokens, usage.completion_tokens);
            }
            permit.finish(RequestStatus::Success);
        } else {
            warn!(status = status.as_u16(), "upstream returned an error status");
            permit.finish(RequestStatus::Error);
        }

        Ok(ForwardResponse {
            status,
            headers,
            body: ResponseBody::Complete(body),
        })
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("controller", &self.controller)
            .field("queue_timeout", &self.queue_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Run `fut` under an optional overall deadline.
async fn within<T>(deadline: Option<Instant>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| HuginnError::Timeout("request"))?,
        None => fut.await,
    }
}

async fn collect(mut body: BodyStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Drop hop-by-hop headers; the HTTP layer sets its own framing.
fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in [CONNECTION, TRANSFER_ENCODING, CONTENT_LENGTH] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers
}

// ============================================================================
// Streaming relay
// ============================================================================

/// Relays upstream chunks to the caller without buffering the stream.
///
/// The first non-empty chunk records time-to-first-token. The request
/// is finalized as `success` at end of stream, `error` on an upstream
/// error or when the overall deadline passes, and `canceled` if the
/// stream is dropped before either.
///
/// The stream is `Unpin`, so callers can drive it with `StreamExt::next`.
pub struct RelayStream {
    body: BodyStream,
    deadline: Option<Pin<Box<Sleep>>>,
    permit: Option<Permit>,
    scanner: UsageScanner,
}

impl RelayStream {
    fn new(body: BodyStream, permit: Permit, deadline: Option<Instant>) -> Self {
        Self {
            body,
            deadline: deadline.map(|at| Box::pin(tokio::time::sleep_until(at))),
            permit: Some(permit),
            scanner: UsageScanner::default(),
        }
    }

    /// Whether the request has already been finalized.
    pub fn is_finished(&self) -> bool {
        self.permit.is_none()
    }
}

fn finish(permit: &mut Option<Permit>, status: RequestStatus) {
    if let Some(permit) = permit.take() {
        permit.finish(status);
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.permit.is_none() {
            return Poll::Ready(None);
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                warn!("request deadline elapsed mid-stream");
                finish(&mut this.permit, RequestStatus::Error);
                return Poll::Ready(Some(Err(HuginnError::Timeout("request"))));
            }
        }

        match this.body.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(permit) = this.permit.as_mut() {
                    if !chunk.is_empty() {
                        permit.mark_first_token();
                    }
                    if let Some(usage) = this.scanner.feed(&chunk) {
                        permit.set_usage(usage.prompt_tokens, usage.completion_tokens);
                    }
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                warn!(error = %err, "upstream stream failed");
                finish(&mut this.permit, err.status());
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                if let (Some(usage), Some(permit)) = (this.scanner.finish(), this.permit.as_mut()) {
                    permit.set_usage(usage.prompt_tokens, usage.completion_tokens);
                }
                debug!("stream completed");
                finish(&mut this.permit, RequestStatus::Success);
                Poll::Ready(None)
            }
        }
    }
}

impl fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayStream")
            .field("permit", &self.permit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_stream_is_unpin() {
        fn assert_unpin<T: Unpin>() {}
        assert_unpin::<RelayStream>();
    }

    #[test]
    fn usage_from_json_body() {
        let body = br#"{"id":"x","usage":{"prompt_tokens":12,"completion_tokens":30,"total_tokens":42}}"#;
        assert_eq!(
            parse_usage(body),
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 30
            })
        );
    }

    #[test]
    fn missing_or_malformed_usage_is_none() {
        assert_eq!(parse_usage(br#"{"id":"x"}"#), None);
        assert_eq!(parse_usage(br#"{"usage":null}"#), None);
        assert_eq!(parse_usage(br#"{"usage":{"prompt_tokens":-3}}"#), None);
        assert_eq!(parse_usage(b"garbage"), None);
    }

    #[test]
    fn scanner_handles_lines_split_across_chunks() {
        let mut scanner = UsageScanner::default();
        assert_eq!(scanner.feed(b"data: {\"choices\":[]}\n\ndata: {\"usa"), None);
        let usage = scanner.feed(b"ge\":{\"prompt_tokens\":5,\"completion_tokens\":7}}\r\n\n");
        assert_eq!(
            usage,
            Some(Usage {
                prompt_tokens: 5,
                completion_tokens: 7
            })
        );
        assert_eq!(scanner.feed(b"data: [DONE]\n\n"), None);
    }

    #[test]
    fn scanner_flushes_trailing_line() {
        let mut scanner = UsageScanner::default();
        assert_eq!(
            scanner.feed(b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2}}"),
            None
        );
        assert_eq!(
            scanner.finish(),
            Some(Usage {
                prompt_tokens: 1,
                completion_tokens: 2
            })
        );
    }

    #[test]
    fn last_usage_event_wins() {
        let mut scanner = UsageScanner::default();
        let usage = scanner.feed(
            b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1}}\n\
              data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":9}}\n",
        );
        assert_eq!(usage.map(|u| u.completion_tokens), Some(9));
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        upstream.insert(CONNECTION, "keep-alive".parse().unwrap());
        upstream.insert(CONTENT_LENGTH, "10".parse().unwrap());
        upstream.insert("keep-alive", "timeout=5".parse().unwrap());
        upstream.insert("x-request-id", "abc".parse().unwrap());

        let relayed = relay_headers(&upstream);
        assert_eq!(relayed.len(), 2);
        assert!(relayed.contains_key(CONTENT_TYPE));
        assert!(relayed.contains_key("x-request-id"));
    }
}
