//! Prometheus metrics for the progress event bus

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug)]
pub struct BusMetrics {
    /// Published events by type
    pub events_published_total: IntCounterVec,
    /// Tasks with a live channel or retained history
    pub active_tasks: IntGauge,
    /// Currently attached subscriptions
    pub live_subscribers: IntGauge,
    /// Retained events dropped to the history cap
    pub history_dropped_total: IntCounter,
    /// Live events skipped by lagging subscribers
    pub subscriber_lag_total: IntCounter,
    /// Finished tasks evicted by the TTL sweep
    pub channels_evicted_total: IntCounter,
}

impl BusMetrics {
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let events_published_total = IntCounterVec::new(
            Opts::new(
                "portray_bus_events_published_total",
                "Progress events published, by event type",
            ),
            &["event_type"],
        )?;
        let active_tasks = IntGauge::new(
            "portray_bus_active_tasks",
            "Tasks currently tracked by the bus",
        )?;
        let live_subscribers = IntGauge::new(
            "portray_bus_live_subscribers",
            "Currently attached subscriptions",
        )?;
        let history_dropped_total = IntCounter::new(
            "portray_bus_history_dropped_total",
            "Retained events dropped to the history cap",
        )?;
        let subscriber_lag_total = IntCounter::new(
            "portray_bus_subscriber_lag_total",
            "Live events skipped by lagging subscribers",
        )?;
        let channels_evicted_total = IntCounter::new(
            "portray_bus_channels_evicted_total",
            "Finished tasks evicted by the TTL sweep",
        )?;

        registry.register(Box::new(events_published_total.clone()))?;
        registry.register(Box::new(active_tasks.clone()))?;
        registry.register(Box::new(live_subscribers.clone()))?;
        registry.register(Box::new(history_dropped_total.clone()))?;
        registry.register(Box::new(subscriber_lag_total.clone()))?;
        registry.register(Box::new(channels_evicted_total.clone()))?;

        Ok(Self {
            events_published_total,
            active_tasks,
            live_subscribers,
            history_dropped_total,
            subscriber_lag_total,
            channels_evicted_total,
        })
    }

    #[cfg(test)]
    pub fn new_unregistered() -> Self {
        Self {
            events_published_total: IntCounterVec::new(
                Opts::new("test_bus_events_published_total", "test"),
                &["event_type"],
            )
            .unwrap(),
            active_tasks: IntGauge::new("test_bus_active_tasks", "test").unwrap(),
            live_subscribers: IntGauge::new("test_bus_live_subscribers", "test").unwrap(),
            history_dropped_total: IntCounter::new("test_bus_history_dropped_total", "test")
                .unwrap(),
            subscriber_lag_total: IntCounter::new("test_bus_subscriber_lag_total", "test").unwrap(),
            channels_evicted_total: IntCounter::new("test_bus_channels_evicted_total", "test")
                .unwrap(),
        }
    }
}
