//! Request dispatch and response shaping.
//!
//! Routes are matched on path segments, so `/api/v1/tasks/{id}/status` and
//! friends normalize to a fixed label set for metrics.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, error};

use crate::handlers;
use crate::AppState;

/// Uniform response body type: buffered payloads and live progress streams
/// boxed behind the same interface.
pub type ApiBody = UnsyncBoxBody<Bytes, Infallible>;

/// Route a request, then record the access log line and request metrics.
pub async fn dispatch(state: Arc<AppState>, req: Request<Incoming>) -> Response<ApiBody> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let (route, response) = route(&state, req).await;

    let status = response.status().as_u16();
    debug!(
        method = %method,
        path = %path,
        status,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request handled"
    );
    if let Some(metrics) = &state.metrics {
        metrics
            .requests_total
            .with_label_values(&[method.as_str(), route, &status.to_string()])
            .inc();
        metrics
            .request_duration_seconds
            .with_label_values(&[route])
            .observe(started.elapsed().as_secs_f64());
    }
    response
}

async fn route(
    state: &Arc<AppState>,
    req: Request<Incoming>,
) -> (&'static str, Response<ApiBody>) {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::POST, ["api", "v1", "tasks"]) => {
            let route = "/api/v1/tasks";
            match read_body(state, req).await {
                Ok(body) => (route, handlers::submit(state, &body).await),
                Err(response) => (route, response),
            }
        }
        (&Method::GET, ["api", "v1", "tasks", id, "status"]) => {
            ("/api/v1/tasks/{id}/status", handlers::status(state, id))
        }
        (&Method::GET, ["api", "v1", "tasks", id, "history"]) => {
            ("/api/v1/tasks/{id}/history", handlers::history(state, id))
        }
        (&Method::GET, ["api", "v1", "tasks", id, "stream"]) => {
            ("/api/v1/tasks/{id}/stream", handlers::stream_ndjson(state, id))
        }
        (&Method::GET, ["api", "v1", "tasks", id, "events"]) => {
            ("/api/v1/tasks/{id}/events", handlers::stream_sse(state, id))
        }
        (&Method::POST, ["api", "v1", "tasks", id, "cancel"]) => {
            ("/api/v1/tasks/{id}/cancel", handlers::cancel(state, id))
        }
        (&Method::GET, ["api", "v1", "gpu"]) => ("/api/v1/gpu", handlers::gpu(state)),
        (&Method::GET, ["api", "v1", "assets", id]) => {
            ("/api/v1/assets/{id}", handlers::asset(state, id).await)
        }
        (&Method::GET, ["healthz"]) => ("/healthz", handlers::healthz(state)),
        (&Method::GET, ["metrics"]) => ("/metrics", handlers::metrics_text(state)),
        _ => (
            "unmatched",
            error_response(StatusCode::NOT_FOUND, "no such route"),
        ),
    }
}

/// Collect the request body under the configured size cap.
async fn read_body(
    state: &AppState,
    req: Request<Incoming>,
) -> Result<Bytes, Response<ApiBody>> {
    let limited = Limited::new(req.into_body(), state.limits.max_body_bytes);
    match limited.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(_) => Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "request body exceeds limit or could not be read",
        )),
    }
}

/// Box a fully buffered payload as an [`ApiBody`].
pub fn full_body(bytes: impl Into<Bytes>) -> ApiBody {
    Full::new(bytes.into()).boxed_unsync()
}

/// Serialize `value` as a JSON response with the given status.
pub fn json_response(status: StatusCode, value: &impl Serialize) -> Response<ApiBody> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(full_body(body));
            *response.status_mut() = status;
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            error!(error = %err, "response serialization failed");
            let mut response =
                Response::new(full_body(&br#"{"error":"internal error"}"#[..]));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
    }
}

/// A `{"error": message}` JSON response.
pub fn error_response(status: StatusCode, message: &str) -> Response<ApiBody> {
    json_response(status, &serde_json::json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_json_response_sets_status_and_content_type() {
        let response = json_response(StatusCode::ACCEPTED, &serde_json::json!({"ok": true}));
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["ok"], true);
    }

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(StatusCode::NOT_FOUND, "no such task");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "no such task");
    }
}
