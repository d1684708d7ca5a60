//! A single observer's view of one task's progress stream.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use portray_types::ProgressEvent;

use crate::metrics::BusMetrics;

/// Ordered stream of one task's events: retained backlog first, then
/// live delivery. Ends after the terminal event.
///
/// Dropping a subscription detaches it without affecting the publisher
/// or other subscribers.
#[derive(Debug)]
pub struct Subscription {
    task_id: String,
    backlog: VecDeque<ProgressEvent>,
    live: broadcast::Receiver<ProgressEvent>,
    finished: bool,
    metrics: Option<Arc<BusMetrics>>,
}

impl Subscription {
    pub(crate) fn new(
        task_id: String,
        backlog: VecDeque<ProgressEvent>,
        live: broadcast::Receiver<ProgressEvent>,
        metrics: Option<Arc<BusMetrics>>,
    ) -> Self {
        Self {
            task_id,
            backlog,
            live,
            finished: false,
            metrics,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Next event, or `None` once the stream has ended.
    ///
    /// The stream ends after delivering a terminal event, or when the
    /// bus evicts the task. A subscriber that falls behind the live
    /// channel skips the overwritten events and keeps going.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.backlog.pop_front() {
            if event.is_terminal() {
                self.finished = true;
            }
            return Some(event);
        }
        loop {
            match self.live.recv().await {
                Ok(event) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        task_id = %self.task_id,
                        skipped = skipped,
                        "subscriber lagging, skipping overwritten events"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.subscriber_lag_total.inc_by(skipped);
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.live_subscribers.dec();
        }
    }
}
