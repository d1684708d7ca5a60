//! Prometheus metrics for asset storage

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

pub struct StorageMetrics {
    pub operations_total: IntCounterVec,
    pub operations_failed_total: IntCounterVec,
    pub operation_duration_seconds: Histogram,
    pub bytes_stored_total: IntCounter,
}

impl StorageMetrics {
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let operations_total = IntCounterVec::new(
            Opts::new(
                "portray_storage_operations_total",
                "Total number of asset store operations",
            ),
            &["operation"],
        )?;

        let operations_failed_total = IntCounterVec::new(
            Opts::new(
                "portray_storage_operations_failed_total",
                "Total number of failed asset store operations",
            ),
            &["operation"],
        )?;

        let operation_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "portray_storage_operation_duration_seconds",
            "Duration of asset store operations",
        ))?;

        let bytes_stored_total = IntCounter::new(
            "portray_storage_bytes_stored_total",
            "Total bytes written to the asset store",
        )?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operations_failed_total.clone()))?;
        registry.register(Box::new(operation_duration_seconds.clone()))?;
        registry.register(Box::new(bytes_stored_total.clone()))?;

        Ok(Self {
            operations_total,
            operations_failed_total,
            operation_duration_seconds,
            bytes_stored_total,
        })
    }

    #[cfg(test)]
    pub fn new_unregistered() -> Self {
        Self {
            operations_total: IntCounterVec::new(
                Opts::new("test_storage_operations_total", "test"),
                &["operation"],
            )
            .unwrap(),
            operations_failed_total: IntCounterVec::new(
                Opts::new("test_storage_operations_failed_total", "test"),
                &["operation"],
            )
            .unwrap(),
            operation_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                "test_storage_operation_duration_seconds",
                "test",
            ))
            .unwrap(),
            bytes_stored_total: IntCounter::new("test_storage_bytes_stored_total", "test").unwrap(),
        }
    }
}
