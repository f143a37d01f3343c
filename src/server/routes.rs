//! axum routes: the forwarded completion endpoints plus the metrics,
//! stats and health endpoints.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;

use crate::exposition;
use crate::pipeline::{ForwardResponse, Forwarder, ResponseBody};
use crate::recorder::RecorderSnapshot;
use crate::upstream::ForwardRequest;
use crate::HuginnError;

/// Shared state for every handler.
#[derive(Clone, Debug)]
pub struct AppState {
    forwarder: Forwarder,
}

/// Build the proxy router around `forwarder`.
pub fn router(forwarder: Forwarder) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(forward))
        .route("/v1/completions", post(forward))
        .route("/v1/embeddings", post(forward))
        .route("/tokenize_completion", post(forward))
        .route("/tokenize_chat", post(forward))
        .route("/detokenize", post(forward))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .with_state(AppState { forwarder })
}

async fn forward(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let target = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());
    let request = ForwardRequest::new(target, body).with_headers(&headers);
    match state.forwarder.forward(request).await {
        Ok(response) => relay(response),
        Err(err) => err.into_response(),
    }
}

fn relay(response: ForwardResponse) -> Response {
    let body = match response.body {
        ResponseBody::Complete(bytes) => Body::from(bytes),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    };
    let mut out = Response::new(body);
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let text = exposition::render(&state.forwarder.recorder().snapshot());
    ([(CONTENT_TYPE, exposition::CONTENT_TYPE)], text)
}

async fn stats(State(state): State<AppState>) -> Json<RecorderSnapshot> {
    Json(state.forwarder.recorder().snapshot())
}

async fn health() -> StatusCode {
    StatusCode::OK
}

impl HuginnError {
    /// HTTP status this error is reported with.
    pub fn http_status(&self) -> StatusCode {
        match self {
            HuginnError::AdmissionTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            HuginnError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            HuginnError::Http(_) => StatusCode::BAD_GATEWAY,
            HuginnError::InvalidArgument(_) | HuginnError::Json(_) => StatusCode::BAD_REQUEST,
            HuginnError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            HuginnError::AdmissionTimeout { .. } => "overloaded",
            HuginnError::Timeout(_) => "timeout",
            HuginnError::Http(_) => "upstream_error",
            HuginnError::InvalidArgument(_) | HuginnError::Json(_) => "invalid_request_error",
            HuginnError::Configuration(_) => "internal_error",
        }
    }
}

impl IntoResponse for HuginnError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        (self.http_status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn errors_map_to_http_status() {
        let cases = [
            (
                HuginnError::AdmissionTimeout {
                    waited: Duration::from_secs(1),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (HuginnError::Timeout("read"), StatusCode::GATEWAY_TIMEOUT),
            (HuginnError::Http("reset".into()), StatusCode::BAD_GATEWAY),
            (
                HuginnError::InvalidArgument("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                HuginnError::Configuration("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.http_status(), status, "{err}");
        }
    }
}
