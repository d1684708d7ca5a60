//! Streaming progress responses.
//!
//! Both wire formats carry the same [`ProgressEvent`] JSON documents and end
//! when the subscription ends, which happens after the task's terminal event.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::Response;
use tracing::warn;

use portray_events::Subscription;
use portray_types::ProgressEvent;

use crate::metrics::GatewayMetrics;
use crate::router::{full_body, ApiBody};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
pub const SSE_CONTENT_TYPE: &str = "text/event-stream";

/// Newline-delimited JSON: one event per line.
pub fn ndjson_response(
    subscription: Subscription,
    metrics: Option<Arc<GatewayMetrics>>,
) -> Response<ApiBody> {
    stream_headers(
        event_stream(subscription, metrics, encode_ndjson),
        NDJSON_CONTENT_TYPE,
    )
}

/// Server-sent events: each event as a `data: <json>` frame.
pub fn sse_response(
    subscription: Subscription,
    metrics: Option<Arc<GatewayMetrics>>,
) -> Response<ApiBody> {
    stream_headers(
        event_stream(subscription, metrics, encode_sse),
        SSE_CONTENT_TYPE,
    )
}

/// A stream that opens and immediately ends, for tasks whose events are
/// already gone from the bus.
pub fn closed_stream(content_type: &'static str) -> Response<ApiBody> {
    stream_headers(full_body(Bytes::new()), content_type)
}

fn stream_headers(body: ApiBody, content_type: &'static str) -> Response<ApiBody> {
    let mut response = Response::new(body);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn event_stream(
    mut subscription: Subscription,
    metrics: Option<Arc<GatewayMetrics>>,
    encode: fn(&ProgressEvent) -> Option<Bytes>,
) -> ApiBody {
    let stream = async_stream::stream! {
        let _guard = StreamGuard::new(metrics);
        while let Some(event) = subscription.next().await {
            if let Some(chunk) = encode(&event) {
                yield Ok::<_, Infallible>(Frame::data(chunk));
            }
        }
    };
    StreamBody::new(stream).boxed_unsync()
}

fn encode_ndjson(event: &ProgressEvent) -> Option<Bytes> {
    match serde_json::to_vec(event) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(Bytes::from(line))
        }
        Err(err) => {
            warn!(task_id = %event.task_id, error = %err, "event encoding failed");
            None
        }
    }
}

fn encode_sse(event: &ProgressEvent) -> Option<Bytes> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Bytes::from(format!("data: {json}\n\n"))),
        Err(err) => {
            warn!(task_id = %event.task_id, error = %err, "event encoding failed");
            None
        }
    }
}

/// Keeps the open-stream gauge honest even when the client hangs up early
/// and the stream future is dropped mid-flight.
struct StreamGuard {
    metrics: Option<Arc<GatewayMetrics>>,
}

impl StreamGuard {
    fn new(metrics: Option<Arc<GatewayMetrics>>) -> Self {
        if let Some(metrics) = &metrics {
            metrics.active_streams.inc();
        }
        Self { metrics }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.active_streams.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::json;

    use portray_events::{BusConfig, ProgressBus};
    use portray_types::EventType;

    fn bus_with_finished_task(task_id: &str) -> ProgressBus {
        let bus = ProgressBus::new(BusConfig::default());
        bus.publish(task_id, EventType::StageUpdate, json!({"n": 1}))
            .unwrap();
        bus.publish(task_id, EventType::StageUpdate, json!({"n": 2}))
            .unwrap();
        bus.publish(task_id, EventType::Complete, json!({"n": 3}))
            .unwrap();
        bus
    }

    async fn body_text(response: Response<ApiBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_ndjson_replays_history_then_ends() {
        let bus = bus_with_finished_task("t-nd");
        let response = ndjson_response(bus.subscribe("t-nd"), None);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            NDJSON_CONTENT_TYPE
        );

        let text = body_text(response).await;
        let events: Vec<ProgressEvent> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[2].event_type, EventType::Complete);
    }

    #[tokio::test]
    async fn test_sse_frames_are_data_prefixed() {
        let bus = bus_with_finished_task("t-sse");
        let response = sse_response(bus.subscribe("t-sse"), None);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            SSE_CONTENT_TYPE
        );

        let text = body_text(response).await;
        let frames: Vec<&str> = text
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .collect();
        assert_eq!(frames.len(), 3);
        for frame in &frames {
            let json = frame.strip_prefix("data: ").unwrap();
            let event: ProgressEvent = serde_json::from_str(json).unwrap();
            assert_eq!(event.task_id, "t-sse");
        }
    }

    #[tokio::test]
    async fn test_live_events_follow_the_backlog() {
        let bus = ProgressBus::new(BusConfig::default());
        bus.publish("t-live", EventType::StageUpdate, json!({"n": 1}))
            .unwrap();

        // Subscribe mid-run, then publish more before the body is drained.
        let subscription = bus.subscribe("t-live");
        bus.publish("t-live", EventType::StageUpdate, json!({"n": 2}))
            .unwrap();
        bus.publish("t-live", EventType::Complete, json!({"n": 3}))
            .unwrap();

        let text = body_text(ndjson_response(subscription, None)).await;
        let seqs: Vec<u64> = text
            .lines()
            .map(|line| serde_json::from_str::<ProgressEvent>(line).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_stream_gauge_returns_to_zero() {
        let metrics = Arc::new(GatewayMetrics::new_unregistered());
        let bus = bus_with_finished_task("t-gauge");

        let response = ndjson_response(bus.subscribe("t-gauge"), Some(Arc::clone(&metrics)));
        let _ = body_text(response).await;

        assert_eq!(metrics.active_streams.get(), 0);
    }

    #[tokio::test]
    async fn test_closed_stream_is_empty() {
        let text = body_text(closed_stream(NDJSON_CONTENT_TYPE)).await;
        assert!(text.is_empty());
    }
}
