//! Prometheus metrics for pipeline execution.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Metrics for pipeline task execution.
#[derive(Debug)]
pub struct PipelineMetrics {
    /// Finished tasks by outcome (completed, failed, cancelled).
    pub tasks_total: IntCounterVec,
    /// End-to-end task duration.
    pub task_duration_seconds: Histogram,
    /// Per-stage wall-clock duration.
    pub stage_duration_seconds: HistogramVec,
    /// Failures by error kind.
    pub failures_total: IntCounterVec,
    /// Tasks currently executing stages.
    pub active_tasks: IntGauge,
    /// Jobs accepted but not yet started.
    pub queue_depth: IntGauge,
}

impl PipelineMetrics {
    /// Create metrics registered against the given registry.
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let tasks_total = IntCounterVec::new(
            Opts::new("portray_pipeline_tasks_total", "Finished pipeline tasks"),
            &["outcome"],
        )?;
        let task_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "portray_pipeline_task_duration_seconds",
                "End-to-end pipeline task duration",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;
        let stage_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "portray_pipeline_stage_duration_seconds",
                "Per-stage wall-clock duration",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["stage"],
        )?;
        let failures_total = IntCounterVec::new(
            Opts::new("portray_pipeline_failures_total", "Task failures by kind"),
            &["kind"],
        )?;
        let active_tasks = IntGauge::new(
            "portray_pipeline_active_tasks",
            "Tasks currently executing stages",
        )?;
        let queue_depth = IntGauge::new(
            "portray_pipeline_queue_depth",
            "Jobs accepted but not yet started",
        )?;

        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(task_duration_seconds.clone()))?;
        registry.register(Box::new(stage_duration_seconds.clone()))?;
        registry.register(Box::new(failures_total.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            tasks_total,
            task_duration_seconds,
            stage_duration_seconds,
            failures_total,
            active_tasks,
            queue_depth,
        })
    }

    /// Create metrics without registering them, for tests.
    #[cfg(test)]
    pub fn new_unregistered() -> Self {
        let registry = Registry::new();
        Self::new(&registry).unwrap()
    }
}
