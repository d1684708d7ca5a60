//! Prometheus metrics for the HTTP surface.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Metrics for request handling and open progress streams.
#[derive(Debug)]
pub struct GatewayMetrics {
    /// Requests by method, normalized route, and status code.
    pub requests_total: IntCounterVec,
    /// Request handling latency per normalized route.
    pub request_duration_seconds: HistogramVec,
    /// Progress streams currently connected (NDJSON and SSE).
    pub active_streams: IntGauge,
}

impl GatewayMetrics {
    /// Create metrics registered against the given registry.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let requests_total = IntCounterVec::new(
            Opts::new("portray_gateway_requests_total", "HTTP requests handled"),
            &["method", "route", "status"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "portray_gateway_request_duration_seconds",
                "HTTP request handling latency",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["route"],
        )?;
        let active_streams = IntGauge::new(
            "portray_gateway_active_streams",
            "Progress streams currently connected",
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(active_streams.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            active_streams,
        })
    }

    /// Create metrics without registering them, for tests.
    #[cfg(test)]
    pub fn new_unregistered() -> Self {
        let registry = Registry::new();
        Self::new(&registry).unwrap()
    }
}
