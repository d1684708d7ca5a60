//! Prometheus metrics for GPU admission control

use prometheus::{
    Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug)]
pub struct GpuMetrics {
    /// Admission outcomes by priority ("immediate", "queued", "timeout", "rejected")
    pub admissions_total: IntCounterVec,
    /// Release outcomes ("ok", "not_held", "leaked")
    pub releases_total: IntCounterVec,
    /// Time spent waiting for admission
    pub admission_wait_seconds: Histogram,
    /// Allocatable VRAM budget in MB
    pub vram_budget_mb: IntGauge,
    /// Sum of admitted estimates in MB
    pub vram_used_mb: IntGauge,
    /// Outstanding grants
    pub active_grants: IntGauge,
    /// Requests waiting for capacity
    pub queue_depth: IntGauge,
}

impl GpuMetrics {
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let admissions_total = IntCounterVec::new(
            Opts::new(
                "portray_gpu_admissions_total",
                "GPU admission requests by priority and outcome",
            ),
            &["priority", "outcome"],
        )?;

        let releases_total = IntCounterVec::new(
            Opts::new(
                "portray_gpu_releases_total",
                "GPU grant releases by outcome",
            ),
            &["outcome"],
        )?;

        let admission_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "portray_gpu_admission_wait_seconds",
                "Time admission requests waited for capacity",
            )
            .buckets(vec![0.0, 0.01, 0.05, 0.25, 1.0, 5.0, 15.0, 60.0]),
        )?;

        let vram_budget_mb = IntGauge::new(
            "portray_gpu_vram_budget_mb",
            "Allocatable VRAM budget in MB",
        )?;
        let vram_used_mb = IntGauge::new(
            "portray_gpu_vram_used_mb",
            "Sum of admitted VRAM estimates in MB",
        )?;
        let active_grants = IntGauge::new(
            "portray_gpu_active_grants",
            "Number of outstanding VRAM grants",
        )?;
        let queue_depth = IntGauge::new(
            "portray_gpu_queue_depth",
            "Number of admission requests waiting for capacity",
        )?;

        registry.register(Box::new(admissions_total.clone()))?;
        registry.register(Box::new(releases_total.clone()))?;
        registry.register(Box::new(admission_wait_seconds.clone()))?;
        registry.register(Box::new(vram_budget_mb.clone()))?;
        registry.register(Box::new(vram_used_mb.clone()))?;
        registry.register(Box::new(active_grants.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            admissions_total,
            releases_total,
            admission_wait_seconds,
            vram_budget_mb,
            vram_used_mb,
            active_grants,
            queue_depth,
        })
    }

    #[cfg(test)]
    pub fn new_unregistered() -> Self {
        Self {
            admissions_total: IntCounterVec::new(
                Opts::new("test_gpu_admissions_total", "test"),
                &["priority", "outcome"],
            )
            .unwrap(),
            releases_total: IntCounterVec::new(
                Opts::new("test_gpu_releases_total", "test"),
                &["outcome"],
            )
            .unwrap(),
            admission_wait_seconds: Histogram::with_opts(HistogramOpts::new(
                "test_gpu_admission_wait_seconds",
                "test",
            ))
            .unwrap(),
            vram_budget_mb: IntGauge::new("test_gpu_vram_budget_mb", "test").unwrap(),
            vram_used_mb: IntGauge::new("test_gpu_vram_used_mb", "test").unwrap(),
            active_grants: IntGauge::new("test_gpu_active_grants", "test").unwrap(),
            queue_depth: IntGauge::new("test_gpu_queue_depth", "test").unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_metrics_creation() {
        let registry = Registry::new();
        let metrics = GpuMetrics::new(&registry).expect("metrics");

        let initial = metrics
            .admissions_total
            .with_label_values(&["normal", "immediate"])
            .get();
        assert_eq!(initial, 0);
        assert_eq!(metrics.vram_used_mb.get(), 0);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        let _first = GpuMetrics::new(&registry).expect("metrics");
        assert!(GpuMetrics::new(&registry).is_err());
    }
}
