//! The progress bus: per-task channels, retained history, fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use portray_types::{unix_ms, EventType, ProgressEvent};

use crate::metrics::BusMetrics;
use crate::subscription::Subscription;
use crate::{BusConfig, BusError, BusResult};

/// Per-task channel: bounded retained history plus live fan-out.
#[derive(Debug)]
struct TaskChannel {
    history: VecDeque<ProgressEvent>,
    live: broadcast::Sender<ProgressEvent>,
    next_seq: u64,
    last_publish: Instant,
    terminal_at: Option<Instant>,
}

impl TaskChannel {
    fn new(channel_capacity: usize) -> Self {
        let (live, _) = broadcast::channel(channel_capacity);
        Self {
            history: VecDeque::new(),
            live,
            next_seq: 0,
            last_publish: Instant::now(),
            terminal_at: None,
        }
    }
}

/// Publish/subscribe hub for pipeline progress.
///
/// Cloning is cheap; clones share the same channels.
#[derive(Debug, Clone)]
pub struct ProgressBus {
    config: BusConfig,
    channels: Arc<RwLock<HashMap<String, TaskChannel>>>,
    metrics: Option<Arc<BusMetrics>>,
}

impl ProgressBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            channels: Arc::new(RwLock::new(HashMap::new())),
            metrics: None,
        }
    }

    /// Create a bus that records metrics.
    pub fn with_metrics(config: BusConfig, metrics: Arc<BusMetrics>) -> Self {
        Self {
            config,
            channels: Arc::new(RwLock::new(HashMap::new())),
            metrics: Some(metrics),
        }
    }

    /// Publish an event for a task.
    ///
    /// Assigns the next per-task sequence number and the publish
    /// timestamp, appends to retained history (heartbeats excepted) and
    /// fans out to all live subscribers. After a terminal event further
    /// publishes fail with [`BusError::TaskTerminated`].
    pub fn publish(
        &self,
        task_id: &str,
        event_type: EventType,
        data: serde_json::Value,
    ) -> BusResult<ProgressEvent> {
        let mut channels = self.channels.write();
        let channel = channels
            .entry(task_id.to_string())
            .or_insert_with(|| TaskChannel::new(self.config.channel_capacity));

        if channel.terminal_at.is_some() {
            return Err(BusError::TaskTerminated {
                task_id: task_id.to_string(),
            });
        }

        let event = ProgressEvent {
            task_id: task_id.to_string(),
            event_type,
            data,
            timestamp: unix_ms(),
            seq: channel.next_seq,
        };
        channel.next_seq += 1;
        channel.last_publish = Instant::now();

        if event_type != EventType::Heartbeat {
            channel.history.push_back(event.clone());
            if channel.history.len() > self.config.history_capacity {
                let dropped = channel.history.pop_front();
                warn!(
                    task_id = %task_id,
                    dropped_seq = dropped.map(|e| e.seq).unwrap_or_default(),
                    capacity = self.config.history_capacity,
                    "retained history full, dropping oldest event"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.history_dropped_total.inc();
                }
            }
        }
        if event_type.is_terminal() {
            channel.terminal_at = Some(Instant::now());
            debug!(task_id = %task_id, event_type = %event_type, seq = event.seq, "task stream closed");
        }

        // No live subscribers is not an error.
        let _ = channel.live.send(event.clone());

        if let Some(metrics) = &self.metrics {
            metrics
                .events_published_total
                .with_label_values(&[event_type.as_str()])
                .inc();
            metrics.active_tasks.set(channels.len() as i64);
        }

        Ok(event)
    }

    /// Subscribe to a task's progress.
    ///
    /// The retained history snapshot and the live receiver are taken
    /// under one lock, so the subscriber sees every event exactly once
    /// regardless of when it joins.
    pub fn subscribe(&self, task_id: &str) -> Subscription {
        let mut channels = self.channels.write();
        let channel = channels
            .entry(task_id.to_string())
            .or_insert_with(|| TaskChannel::new(self.config.channel_capacity));

        let backlog: VecDeque<ProgressEvent> = channel.history.iter().cloned().collect();
        let receiver = channel.live.subscribe();

        if let Some(metrics) = &self.metrics {
            metrics.live_subscribers.inc();
            metrics.active_tasks.set(channels.len() as i64);
        }
        debug!(
            task_id = %task_id,
            backlog = backlog.len(),
            "subscriber joined"
        );

        Subscription::new(task_id.to_string(), backlog, receiver, self.metrics.clone())
    }

    /// Latest retained event for a task, if the task is known.
    pub fn latest_event(&self, task_id: &str) -> Option<ProgressEvent> {
        let channels = self.channels.read();
        channels.get(task_id).and_then(|c| c.history.back().cloned())
    }

    /// Full retained history for a task, if the task is known.
    pub fn history(&self, task_id: &str) -> Option<Vec<ProgressEvent>> {
        let channels = self.channels.read();
        channels
            .get(task_id)
            .map(|c| c.history.iter().cloned().collect())
    }

    /// Whether the bus currently tracks the task.
    pub fn knows(&self, task_id: &str) -> bool {
        self.channels.read().contains_key(task_id)
    }

    /// Run heartbeats and history eviction until cancelled.
    pub async fn run_maintenance(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.maintenance_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_ms = self.config.maintenance_interval.as_millis() as u64,
            "progress bus maintenance started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("progress bus maintenance stopped");
                    break;
                }
                _ = interval.tick() => {
                    self.emit_heartbeats();
                    self.evict_expired();
                }
            }
        }
    }

    /// Publish HEARTBEAT for every live-observed task that has been
    /// quiet for a full heartbeat interval. Heartbeats are fanned out but
    /// never retained.
    fn emit_heartbeats(&self) {
        let mut channels = self.channels.write();
        for (task_id, channel) in channels.iter_mut() {
            if channel.terminal_at.is_some()
                || channel.live.receiver_count() == 0
                || channel.last_publish.elapsed() < self.config.heartbeat_interval
            {
                continue;
            }
            let event = ProgressEvent {
                task_id: task_id.clone(),
                event_type: EventType::Heartbeat,
                data: serde_json::json!({}),
                timestamp: unix_ms(),
                seq: channel.next_seq,
            };
            channel.next_seq += 1;
            channel.last_publish = Instant::now();
            let _ = channel.live.send(event);
            if let Some(metrics) = &self.metrics {
                metrics
                    .events_published_total
                    .with_label_values(&[EventType::Heartbeat.as_str()])
                    .inc();
            }
        }
    }

    /// Drop finished tasks past their retention TTL, plus channels that
    /// were created by a subscribe but never saw a publish or observer.
    fn evict_expired(&self) {
        let ttl = self.config.history_ttl;
        let mut evicted = 0usize;
        let mut channels = self.channels.write();
        channels.retain(|task_id, channel| {
            let expired = match channel.terminal_at {
                Some(terminal_at) => terminal_at.elapsed() > ttl,
                None => {
                    channel.history.is_empty()
                        && channel.live.receiver_count() == 0
                        && channel.last_publish.elapsed() > ttl
                }
            };
            if expired {
                debug!(task_id = %task_id, "evicting expired task history");
                evicted += 1;
            }
            !expired
        });
        if evicted > 0 {
            if let Some(metrics) = &self.metrics {
                metrics.channels_evicted_total.inc_by(evicted as u64);
                metrics.active_tasks.set(channels.len() as i64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> ProgressBus {
        ProgressBus::new(BusConfig::default())
    }

    async fn collect(mut sub: Subscription) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_publish_assigns_sequence_and_retains() {
        let bus = bus();

        for i in 0..3 {
            let event = bus
                .publish("t1", EventType::StageUpdate, json!({ "step": i }))
                .unwrap();
            assert_eq!(event.seq, i);
            assert_eq!(event.task_id, "t1");
        }

        let history = bus.history("t1").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].data["step"], 2);
        assert_eq!(bus.latest_event("t1").unwrap().seq, 2);
        assert!(bus.history("unknown").is_none());
    }

    #[tokio::test]
    async fn test_history_capacity_drops_oldest() {
        let config = BusConfig {
            history_capacity: 4,
            ..BusConfig::default()
        };
        let bus = ProgressBus::new(config);

        for i in 0..6 {
            bus.publish("t1", EventType::StageUpdate, json!({ "step": i }))
                .unwrap();
        }

        let history = bus.history("t1").unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].seq, 2);
        assert_eq!(history[3].seq, 5);
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_history_then_live() {
        let bus = bus();

        for i in 0..3 {
            bus.publish("t1", EventType::StageUpdate, json!({ "step": i }))
                .unwrap();
        }
        let sub = bus.subscribe("t1");
        for i in 3..5 {
            bus.publish("t1", EventType::StageUpdate, json!({ "step": i }))
                .unwrap();
        }
        bus.publish("t1", EventType::Complete, json!({ "ok": true }))
            .unwrap();

        let events = collect(sub).await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(events.last().unwrap().event_type, EventType::Complete);
    }

    #[tokio::test]
    async fn test_early_and_late_subscribers_see_identical_streams() {
        let bus = bus();
        let early = bus.subscribe("t1");

        for i in 0..4 {
            bus.publish("t1", EventType::StageUpdate, json!({ "step": i }))
                .unwrap();
        }
        let late = bus.subscribe("t1");
        bus.publish("t1", EventType::StageUpdate, json!({ "step": 4 }))
            .unwrap();
        bus.publish("t1", EventType::Complete, json!({}))
            .unwrap();

        let early_events = collect(early).await;
        let late_events = collect(late).await;
        assert_eq!(early_events, late_events);
        assert_eq!(early_events.len(), 6);
    }

    #[tokio::test]
    async fn test_subscription_ends_after_terminal() {
        let bus = bus();
        let mut sub = bus.subscribe("t1");

        bus.publish("t1", EventType::StageUpdate, json!({})).unwrap();
        bus.publish("t1", EventType::Error, json!({ "error": "boom" }))
            .unwrap();

        assert_eq!(sub.next().await.unwrap().event_type, EventType::StageUpdate);
        assert_eq!(sub.next().await.unwrap().event_type, EventType::Error);
        assert!(sub.next().await.is_none());
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_after_terminal_rejected() {
        let bus = bus();
        bus.publish("t1", EventType::Complete, json!({})).unwrap();

        let result = bus.publish("t1", EventType::StageUpdate, json!({}));
        assert!(matches!(result, Err(BusError::TaskTerminated { .. })));

        // Exactly one terminal event in the retained history.
        let history = bus.history("t1").unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_terminal());
    }

    #[tokio::test]
    async fn test_abandoned_subscriber_does_not_affect_others() {
        let bus = bus();
        let abandoned = bus.subscribe("t1");
        let kept = bus.subscribe("t1");

        bus.publish("t1", EventType::StageUpdate, json!({ "step": 0 }))
            .unwrap();
        drop(abandoned);
        bus.publish("t1", EventType::StageUpdate, json!({ "step": 1 }))
            .unwrap();
        bus.publish("t1", EventType::Complete, json!({})).unwrap();

        let events = collect(kept).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events.last().unwrap().event_type, EventType::Complete);
    }

    #[tokio::test]
    async fn test_subscriber_joining_after_terminal_replays_and_ends() {
        let bus = bus();
        bus.publish("t1", EventType::StageUpdate, json!({})).unwrap();
        bus.publish("t1", EventType::Complete, json!({})).unwrap();

        let events = collect(bus.subscribe("t1")).await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest_and_continues() {
        let config = BusConfig {
            channel_capacity: 2,
            ..BusConfig::default()
        };
        let bus = ProgressBus::new(config);
        let sub = bus.subscribe("t1");

        for i in 0..5 {
            bus.publish("t1", EventType::StageUpdate, json!({ "step": i }))
                .unwrap();
        }
        bus.publish("t1", EventType::Complete, json!({})).unwrap();

        // Capacity 2: the slow consumer finds only the newest two frames.
        let events = collect(sub).await;
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_heartbeat_for_quiet_observed_task() {
        let config = BusConfig {
            heartbeat_interval: std::time::Duration::from_millis(10),
            ..BusConfig::default()
        };
        let bus = ProgressBus::new(config);
        let mut sub = bus.subscribe("t1");

        bus.publish("t1", EventType::StageUpdate, json!({})).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.emit_heartbeats();

        assert_eq!(sub.next().await.unwrap().event_type, EventType::StageUpdate);
        let heartbeat = sub.next().await.unwrap();
        assert_eq!(heartbeat.event_type, EventType::Heartbeat);
        assert_eq!(heartbeat.seq, 1);

        // Heartbeats are never retained.
        assert_eq!(bus.history("t1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_heartbeat_without_subscribers() {
        let config = BusConfig {
            heartbeat_interval: std::time::Duration::from_millis(10),
            ..BusConfig::default()
        };
        let bus = ProgressBus::new(config);

        bus.publish("t1", EventType::StageUpdate, json!({})).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.emit_heartbeats();

        // No subscriber, so no heartbeat consumed a sequence number.
        let next = bus
            .publish("t1", EventType::StageUpdate, json!({}))
            .unwrap();
        assert_eq!(next.seq, 1);
    }

    #[tokio::test]
    async fn test_finished_tasks_evicted_after_ttl() {
        let config = BusConfig {
            history_ttl: std::time::Duration::from_millis(20),
            ..BusConfig::default()
        };
        let bus = ProgressBus::new(config);

        bus.publish("done", EventType::Complete, json!({})).unwrap();
        bus.publish("running", EventType::StageUpdate, json!({}))
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        bus.evict_expired();

        assert!(!bus.knows("done"));
        // Unfinished tasks are never evicted.
        assert!(bus.knows("running"));
    }

    #[tokio::test]
    async fn test_eviction_closes_open_subscriptions() {
        let config = BusConfig {
            history_ttl: std::time::Duration::from_millis(10),
            ..BusConfig::default()
        };
        let bus = ProgressBus::new(config);

        bus.publish("t1", EventType::StageUpdate, json!({})).unwrap();
        let mut sub = bus.subscribe("t1");
        assert_eq!(sub.next().await.unwrap().seq, 0);

        bus.publish("t1", EventType::Complete, json!({})).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.evict_expired();
        assert!(!bus.knows("t1"));

        // The already-received terminal still ends the stream cleanly.
        assert_eq!(sub.next().await.unwrap().event_type, EventType::Complete);
        assert!(sub.next().await.is_none());
    }
}
