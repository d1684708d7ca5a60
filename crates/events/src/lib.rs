//! Per-task progress event bus.
//!
//! Pipeline tasks publish [`ProgressEvent`](portray_types::ProgressEvent)s
//! through the bus; any number of observers subscribe per task. The bus
//! keeps a bounded history per task so a subscriber joining mid-run
//! receives everything published so far, then the live stream, with no
//! gap or duplicate at the boundary. A terminal event (`COMPLETE` or
//! `ERROR`) ends every subscription; retained history stays readable for
//! polling clients until a TTL sweep evicts the finished task.
//!
//! Delivery rides a bounded broadcast channel per task: the publisher
//! never blocks on a slow consumer, a lagging subscriber skips the
//! overwritten events, and abandoned receivers are reclaimed by the
//! channel itself.

pub mod bus;
pub mod metrics;
pub mod subscription;

pub use bus::ProgressBus;
pub use metrics::{BusMetrics, MetricsError};
pub use subscription::Subscription;

use std::time::Duration;

use thiserror::Error;

/// Error type for event bus operations.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// Publish attempted after the task's terminal event.
    #[error("task '{task_id}' already published its terminal event")]
    TaskTerminated { task_id: String },
}

pub type BusResult<T> = Result<T, BusError>;

/// Event bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Retained events per task; oldest dropped beyond this
    pub history_capacity: usize,
    /// Live broadcast channel capacity per task
    pub channel_capacity: usize,
    /// Publish a HEARTBEAT for quiet tasks with live subscribers after
    /// this much silence
    pub heartbeat_interval: Duration,
    /// How long finished tasks stay readable before eviction
    pub history_ttl: Duration,
    /// Cadence of the heartbeat/eviction maintenance pass
    pub maintenance_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 256,
            channel_capacity: 256,
            heartbeat_interval: Duration::from_secs(15),
            history_ttl: Duration::from_secs(15 * 60),
            maintenance_interval: Duration::from_secs(5),
        }
    }
}
