//! Endpoint handlers.
//!
//! Each handler is a plain function over [`AppState`] so the routing layer
//! stays a thin match and the behavior is testable without a socket.

use base64::prelude::*;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use portray_events::Subscription;
use portray_pipeline::{RegistryError, SubmittedJob, ValidationError};
use portray_storage::{parse_asset_id, AssetKind, StorageError};
use portray_types::{
    GrantPriority, PersonSelection, PipelineOptions, PipelineResult, StageThresholds, TaskStatus,
};

use crate::router::{error_response, full_body, json_response, ApiBody};
use crate::stream::{
    closed_stream, ndjson_response, sse_response, NDJSON_CONTENT_TYPE, SSE_CONTENT_TYPE,
};
use crate::AppState;

/// Body of `POST /api/v1/tasks`.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Base64-encoded portrait image.
    pub image: String,
    /// Base64-encoded speech audio.
    pub audio: String,
    /// Pick a specific detection instead of the largest bounding box.
    #[serde(default)]
    pub person_index: Option<usize>,
    /// Run the synthesis stage; disable for a matting-only preview.
    #[serde(default = "default_synthesize")]
    pub synthesize: bool,
    #[serde(default)]
    pub thresholds: StageThresholds,
    #[serde(default)]
    pub priority: GrantPriority,
}

fn default_synthesize() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    task_id: String,
    status_url: String,
    stream_url: String,
    events_url: String,
}

/// Accept a generation job: validate, persist inputs, register, enqueue.
pub async fn submit(state: &AppState, body: &[u8]) -> Response<ApiBody> {
    let request: SubmitRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {err}"),
            )
        }
    };

    let image = match decode_field("image", &request.image, state.limits.max_image_bytes) {
        Ok(bytes) => bytes,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let audio = match decode_field("audio", &request.audio, state.limits.max_audio_bytes) {
        Ok(bytes) => bytes,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let options = PipelineOptions {
        selection: match request.person_index {
            Some(index) => PersonSelection::Index(index),
            None => PersonSelection::LargestBoundingBox,
        },
        synthesize: request.synthesize,
        thresholds: request.thresholds,
        priority: request.priority,
    };

    // Inputs are persisted before the job is accepted, so a queued task can
    // always be executed later even if the client goes away.
    let image_asset = match state.storage.put(AssetKind::Image, &image).await {
        Ok(asset) => asset,
        Err(err) => {
            warn!(error = %err, "failed to store portrait image");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to store input",
            );
        }
    };
    let audio_asset = match state.storage.put(AssetKind::Audio, &audio).await {
        Ok(asset) => asset,
        Err(err) => {
            warn!(error = %err, "failed to store audio clip");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to store input",
            );
        }
    };

    let task_id = Uuid::new_v4().to_string();
    state.registry.insert(
        &task_id,
        options.clone(),
        image_asset.id.clone(),
        audio_asset.id.clone(),
    );

    let job = SubmittedJob {
        task_id: task_id.clone(),
        image_asset: image_asset.id,
        audio_asset: audio_asset.id,
        options,
    };
    if let Err(err) = state.submitter.submit(job) {
        // The job never reached the queue; close out the registry record so
        // nothing sits in `queued` forever.
        state.registry.complete(
            &task_id,
            TaskStatus::Failed,
            PipelineResult::failure(&task_id, err.to_string(), 0),
        );
        warn!(task_id = %task_id, error = %err, "submission rejected");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string());
    }

    info!(
        task_id = %task_id,
        image_bytes = image.len(),
        audio_bytes = audio.len(),
        synthesize = request.synthesize,
        "task accepted"
    );
    json_response(
        StatusCode::ACCEPTED,
        &SubmitResponse {
            status_url: format!("/api/v1/tasks/{task_id}/status"),
            stream_url: format!("/api/v1/tasks/{task_id}/stream"),
            events_url: format!("/api/v1/tasks/{task_id}/events"),
            task_id,
        },
    )
}

fn decode_field(
    field: &'static str,
    value: &str,
    limit: usize,
) -> Result<Vec<u8>, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    let decoded = BASE64_STANDARD
        .decode(value)
        .map_err(|_| ValidationError::InvalidBase64 { field })?;
    if decoded.len() > limit {
        return Err(ValidationError::TooLarge {
            field,
            actual: decoded.len(),
            limit,
        });
    }
    Ok(decoded)
}

/// Registry status plus the latest retained progress event.
pub fn status(state: &AppState, task_id: &str) -> Response<ApiBody> {
    let Some(record) = state.registry.get(task_id) else {
        return error_response(StatusCode::NOT_FOUND, "no such task");
    };
    json_response(
        StatusCode::OK,
        &json!({
            "task_id": record.task_id,
            "status": record.status,
            "submitted_at_ms": record.submitted_at_ms,
            "latest_event": state.bus.latest_event(task_id),
            "result": record.result,
        }),
    )
}

/// Every retained progress event, oldest first.
pub fn history(state: &AppState, task_id: &str) -> Response<ApiBody> {
    match state.bus.history(task_id) {
        Some(events) => json_response(
            StatusCode::OK,
            &json!({ "task_id": task_id, "events": events }),
        ),
        // The bus may have evicted a finished task; still answer for tasks
        // the registry remembers.
        None if state.registry.get(task_id).is_some() => json_response(
            StatusCode::OK,
            &json!({ "task_id": task_id, "events": [] }),
        ),
        None => error_response(StatusCode::NOT_FOUND, "no such task"),
    }
}

/// Live progress as NDJSON, history replayed first.
pub fn stream_ndjson(state: &AppState, task_id: &str) -> Response<ApiBody> {
    match task_subscription(state, task_id, NDJSON_CONTENT_TYPE) {
        Ok(subscription) => ndjson_response(subscription, state.metrics.clone()),
        Err(response) => response,
    }
}

/// Live progress as server-sent events, history replayed first.
pub fn stream_sse(state: &AppState, task_id: &str) -> Response<ApiBody> {
    match task_subscription(state, task_id, SSE_CONTENT_TYPE) {
        Ok(subscription) => sse_response(subscription, state.metrics.clone()),
        Err(response) => response,
    }
}

fn task_subscription(
    state: &AppState,
    task_id: &str,
    content_type: &'static str,
) -> Result<Subscription, Response<ApiBody>> {
    if state.bus.knows(task_id) {
        return Ok(state.bus.subscribe(task_id));
    }
    match state.registry.get(task_id) {
        // Queued with nothing published yet: subscribing now still catches
        // the first event.
        Some(record) if !record.status.is_terminal() => Ok(state.bus.subscribe(task_id)),
        // Finished and already evicted from the bus: open and close.
        Some(_) => Err(closed_stream(content_type)),
        None => Err(error_response(StatusCode::NOT_FOUND, "no such task")),
    }
}

/// Request cooperative cancellation. The task stops at its next stage
/// boundary, so a 202 here does not mean the task is gone yet.
pub fn cancel(state: &AppState, task_id: &str) -> Response<ApiBody> {
    match state.registry.request_cancel(task_id) {
        Ok(()) => json_response(
            StatusCode::ACCEPTED,
            &json!({ "task_id": task_id, "cancelling": true }),
        ),
        Err(RegistryError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "no such task")
        }
        Err(err @ RegistryError::AlreadyFinished(_)) => {
            error_response(StatusCode::CONFLICT, &err.to_string())
        }
    }
}

/// VRAM ledger snapshot: budget, outstanding grants, queue depth.
pub fn gpu(state: &AppState) -> Response<ApiBody> {
    json_response(StatusCode::OK, &state.gpu.utilization())
}

/// Serve a stored asset with its kind's content type.
pub async fn asset(state: &AppState, asset_id: &str) -> Response<ApiBody> {
    let kind = match parse_asset_id(asset_id) {
        Ok((kind, _)) => kind,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    match state.storage.get(asset_id).await {
        Ok(data) => {
            let mut response = Response::new(full_body(data));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(kind.content_type()));
            response
        }
        Err(StorageError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "no such asset"),
        Err(err) => {
            warn!(asset_id = %asset_id, error = %err, "asset fetch failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "asset fetch failed")
        }
    }
}

pub fn healthz(state: &AppState) -> Response<ApiBody> {
    let utilization = state.gpu.utilization();
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "tasks": state.registry.counts(),
            "gpu": {
                "used_mb": utilization.used_mb,
                "available_mb": utilization.available_mb,
            },
        }),
    )
}

/// Prometheus text exposition of everything in the shared registry.
pub fn metrics_text(state: &AppState) -> Response<ApiBody> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&state.metrics_registry.gather(), &mut buffer) {
        warn!(error = %err, "metrics encoding failed");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed");
    }
    let content_type = HeaderValue::from_str(encoder.format_type())
        .unwrap_or_else(|_| HeaderValue::from_static("text/plain"));
    let mut response = Response::new(full_body(buffer));
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use http_body_util::BodyExt;
    use serde_json::Value;

    use portray_events::{BusConfig, ProgressBus};
    use portray_gpu::{GpuResourceManager, VramBudget};
    use portray_pipeline::testing::{detection, MockDetector, MockMatter, MockSynthesizer};
    use portray_pipeline::{
        PipelineConfig, PipelineController, TaskRegistry, WorkerConfig, WorkerService,
    };
    use portray_storage::StorageManager;
    use portray_types::EventType;

    use crate::{GatewayMetrics, RequestLimits};

    struct TestState {
        state: Arc<AppState>,
        // Dropping the service closes the job queue, so hold it.
        _worker: WorkerService,
        _dir: tempfile::TempDir,
    }

    fn build_state() -> TestState {
        build_state_with(RequestLimits::default(), WorkerConfig::default())
    }

    fn build_state_with(limits: RequestLimits, worker_config: WorkerConfig) -> TestState {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::local(dir.path().to_path_buf()).unwrap();
        let bus = ProgressBus::new(BusConfig::default());
        let gpu = GpuResourceManager::new(VramBudget::with_reserved(12_000, 0));
        let registry = Arc::new(TaskRegistry::new());

        let controller = Arc::new(PipelineController::new(
            PipelineConfig::default(),
            gpu.clone(),
            bus.clone(),
            storage.clone(),
            Arc::new(MockDetector::returning(vec![detection(80.0, 120.0, 0.9)])),
            Arc::new(MockMatter::succeeding()),
            Arc::new(MockSynthesizer::succeeding()),
        ));
        let (worker, submitter) =
            WorkerService::new(worker_config, controller, Arc::clone(&registry), None);

        let metrics_registry = prometheus::Registry::new();
        let metrics = GatewayMetrics::new(&metrics_registry).unwrap();
        let state = Arc::new(AppState {
            bus,
            gpu,
            storage,
            registry,
            submitter,
            metrics_registry,
            limits,
            metrics: Some(Arc::new(metrics)),
        });
        TestState {
            state,
            _worker: worker,
            _dir: dir,
        }
    }

    fn submit_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "image": BASE64_STANDARD.encode(b"portrait-bytes"),
            "audio": BASE64_STANDARD.encode(b"audio-bytes"),
        }))
        .unwrap()
    }

    async fn body_json(response: Response<ApiBody>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_submit_accepts_and_registers() {
        let harness = build_state();
        let response = submit(&harness.state, &submit_body()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = body_json(response).await;
        let task_id = body["task_id"].as_str().unwrap();
        assert_eq!(
            body["status_url"],
            format!("/api/v1/tasks/{task_id}/status")
        );
        assert_eq!(
            body["stream_url"],
            format!("/api/v1/tasks/{task_id}/stream")
        );
        assert_eq!(
            body["events_url"],
            format!("/api/v1/tasks/{task_id}/events")
        );

        let record = harness.state.registry.get(task_id).unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert!(record.image_asset.starts_with("image-"));
        assert!(record.audio_asset.starts_with("audio-"));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_json() {
        let harness = build_state();
        let response = submit(&harness.state, b"{not json").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid request body"));
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_base64() {
        let harness = build_state();
        let body = serde_json::to_vec(&json!({
            "image": "!!not-base64!!",
            "audio": BASE64_STANDARD.encode(b"audio"),
        }))
        .unwrap();

        let response = submit(&harness.state, &body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "field 'image' is not valid base64");
    }

    #[tokio::test]
    async fn test_submit_rejects_oversize_image() {
        let limits = RequestLimits {
            max_image_bytes: 4,
            ..RequestLimits::default()
        };
        let harness = build_state_with(limits, WorkerConfig::default());

        let response = submit(&harness.state, &submit_body()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "field 'image' is 14 bytes, limit is 4");
    }

    #[tokio::test]
    async fn test_submit_queue_full_returns_503() {
        let worker_config = WorkerConfig {
            queue_capacity: 1,
            ..WorkerConfig::default()
        };
        let harness = build_state_with(RequestLimits::default(), worker_config);

        // Worker loop is not running, so the first job stays queued.
        let first = submit(&harness.state, &submit_body()).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = submit(&harness.state, &submit_body()).await;
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(second).await;
        assert!(body["error"].as_str().unwrap().contains("queue full"));

        // The rejected task is closed out, not left dangling in queued.
        let counts = harness.state.registry.counts();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.finished, 1);
    }

    #[tokio::test]
    async fn test_status_unknown_task_404() {
        let harness = build_state();
        let response = status(&harness.state, "missing");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_reports_queued_task() {
        let harness = build_state();
        let response = submit(&harness.state, &submit_body()).await;
        let task_id = body_json(response).await["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        let body = body_json(status(&harness.state, &task_id)).await;
        assert_eq!(body["status"], "queued");
        assert_eq!(body["latest_event"], Value::Null);
        assert_eq!(body["result"], Value::Null);
    }

    #[tokio::test]
    async fn test_status_includes_latest_event() {
        let harness = build_state();
        harness.state.registry.insert(
            "t-ev",
            PipelineOptions::default(),
            "image-a".into(),
            "audio-b".into(),
        );
        harness
            .state
            .bus
            .publish("t-ev", EventType::StageUpdate, json!({"progress_percent": 20}))
            .unwrap();

        let body = body_json(status(&harness.state, "t-ev")).await;
        assert_eq!(body["latest_event"]["event_type"], "STAGE_UPDATE");
        assert_eq!(body["latest_event"]["data"]["progress_percent"], 20);
    }

    #[tokio::test]
    async fn test_history_unknown_task_404() {
        let harness = build_state();
        let response = history(&harness.state, "missing");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_history_returns_retained_events() {
        let harness = build_state();
        harness
            .state
            .bus
            .publish("t-h", EventType::StageUpdate, json!({"n": 1}))
            .unwrap();
        harness
            .state
            .bus
            .publish("t-h", EventType::StageUpdate, json!({"n": 2}))
            .unwrap();

        let body = body_json(history(&harness.state, "t-h")).await;
        assert_eq!(body["events"].as_array().unwrap().len(), 2);
        assert_eq!(body["events"][0]["seq"], 0);
    }

    #[tokio::test]
    async fn test_history_empty_for_evicted_but_registered_task() {
        let harness = build_state();
        harness.state.registry.insert(
            "t-old",
            PipelineOptions::default(),
            "image-a".into(),
            "audio-b".into(),
        );

        let body = body_json(history(&harness.state, "t-old")).await;
        assert_eq!(body["events"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_404_finished_409() {
        let harness = build_state();
        assert_eq!(
            cancel(&harness.state, "missing").status(),
            StatusCode::NOT_FOUND
        );

        harness.state.registry.insert(
            "t-done",
            PipelineOptions::default(),
            "image-a".into(),
            "audio-b".into(),
        );
        harness.state.registry.complete(
            "t-done",
            TaskStatus::Completed,
            PipelineResult::success("t-done", "/api/v1/assets/video-x", 5),
        );
        assert_eq!(
            cancel(&harness.state, "t-done").status(),
            StatusCode::CONFLICT
        );
    }

    #[tokio::test]
    async fn test_cancel_fires_the_token() {
        let harness = build_state();
        let token = harness.state.registry.insert(
            "t-cancel",
            PipelineOptions::default(),
            "image-a".into(),
            "audio-b".into(),
        );

        let response = cancel(&harness.state, "t-cancel");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_asset_roundtrip_and_content_type() {
        let harness = build_state();
        let stored = harness
            .state
            .storage
            .put(AssetKind::Video, b"frames")
            .await
            .unwrap();

        let response = asset(&harness.state, &stored.id).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "video/mp4"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"frames");
    }

    #[tokio::test]
    async fn test_asset_rejects_bad_ids() {
        let harness = build_state();
        assert_eq!(
            asset(&harness.state, "no-separator-kind").await.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            asset(&harness.state, "video-doesnotexist").await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_stream_unknown_404_and_evicted_empty() {
        let harness = build_state();
        assert_eq!(
            stream_ndjson(&harness.state, "missing").status(),
            StatusCode::NOT_FOUND
        );

        harness.state.registry.insert(
            "t-evicted",
            PipelineOptions::default(),
            "image-a".into(),
            "audio-b".into(),
        );
        harness.state.registry.complete(
            "t-evicted",
            TaskStatus::Completed,
            PipelineResult::success("t-evicted", "/api/v1/assets/video-x", 5),
        );

        let response = stream_ndjson(&harness.state, "t-evicted");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_healthz_shape() {
        let harness = build_state();
        let body = body_json(healthz(&harness.state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tasks"]["queued"], 0);
        assert_eq!(body["gpu"]["used_mb"], 0);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let harness = build_state();
        let response = metrics_text(&harness.state);
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("portray_gateway_active_streams"));
    }

    #[tokio::test]
    async fn test_gpu_snapshot_shape() {
        let harness = build_state();
        let body = body_json(gpu(&harness.state)).await;
        assert_eq!(body["total_mb"], 12_000);
        assert_eq!(body["active_grants"], 0);
    }
}
