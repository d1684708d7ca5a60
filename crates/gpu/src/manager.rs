//! GPU admission manager.
//!
//! `GpuResourceManager` serializes access to a shared accelerator by VRAM
//! estimate: a request is granted immediately when it fits the remaining
//! budget, otherwise it waits in a queue ordered by priority then arrival.
//! Every release re-scans the queue in order and admits every waiter that
//! now fits, so freed capacity is handed to the highest-priority eligible
//! request first. Waiters carry explicit timeouts; a timeout of zero means
//! "now or never" and returns without suspending.
//!
//! The ledger mutex is a plain (non-async) lock and is never held across
//! an await; waiters park on per-request oneshot channels instead.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use portray_types::GrantPriority;

use crate::budget::VramBudget;
use crate::ledger::{GrantRecord, VramLedger};
use crate::metrics::GpuMetrics;
use crate::{GpuError, GpuResult, GpuUtilization, GrantSnapshot, QueuedSnapshot};

/// A queued admission request waiting for capacity.
#[derive(Debug)]
struct Waiter {
    request_id: String,
    task_id: String,
    vram_mb: u64,
    priority: GrantPriority,
    queued_at: Instant,
    tx: oneshot::Sender<GrantRecord>,
}

#[derive(Debug)]
struct ManagerState {
    ledger: VramLedger,
    queue: VecDeque<Waiter>,
    metrics: Option<Arc<GpuMetrics>>,
}

/// VRAM admission control for a single shared GPU.
///
/// Cloning is cheap; clones share the same ledger and queue.
#[derive(Debug, Clone)]
pub struct GpuResourceManager {
    state: Arc<Mutex<ManagerState>>,
}

impl GpuResourceManager {
    pub fn new(budget: VramBudget) -> Self {
        info!(budget = %budget, "GPU admission manager initialized");
        Self {
            state: Arc::new(Mutex::new(ManagerState {
                ledger: VramLedger::new(budget),
                queue: VecDeque::new(),
                metrics: None,
            })),
        }
    }

    /// Create a manager that records admission metrics.
    pub fn with_metrics(budget: VramBudget, metrics: Arc<GpuMetrics>) -> Self {
        metrics.vram_budget_mb.set(budget.allocatable() as i64);
        info!(budget = %budget, "GPU admission manager initialized");
        Self {
            state: Arc::new(Mutex::new(ManagerState {
                ledger: VramLedger::new(budget),
                queue: VecDeque::new(),
                metrics: Some(metrics),
            })),
        }
    }

    /// Acquire a VRAM grant, waiting up to `timeout` for capacity.
    ///
    /// # Arguments
    /// * `task_id` - Owning pipeline task, for audit and metrics
    /// * `vram_mb` - VRAM estimate to reserve in MB
    /// * `priority` - Queue priority when the request cannot be granted
    ///   immediately
    /// * `timeout` - Maximum time to wait; `Duration::ZERO` fails instead
    ///   of queueing
    ///
    /// # Errors
    /// - [`GpuError::AdmissionRejected`] if the estimate exceeds the whole
    ///   allocatable budget and could never be granted
    /// - [`GpuError::AdmissionTimeout`] if capacity did not free up in time
    pub async fn acquire(
        &self,
        task_id: &str,
        vram_mb: u64,
        priority: GrantPriority,
        timeout: Duration,
    ) -> GpuResult<GpuGrant> {
        let request_id = Uuid::new_v4().to_string();

        // Fast path and enqueue decide under one critical section so a
        // concurrent release cannot slip between the check and the queue
        // insert.
        let mut rx = {
            let mut state = self.state.lock();

            if vram_mb > state.ledger.budget().allocatable() {
                Self::count_admission(&state, priority, "rejected");
                return Err(GpuError::AdmissionRejected {
                    requested_mb: vram_mb,
                    used_mb: state.ledger.used(),
                    allocatable_mb: state.ledger.budget().allocatable(),
                });
            }

            if state.ledger.can_admit(vram_mb) {
                let record = Self::admit_now(&mut state, &request_id, task_id, vram_mb, priority)?;
                Self::count_admission(&state, priority, "immediate");
                Self::observe_wait(&state, Duration::ZERO);
                Self::apply_gauges(&state);
                return Ok(self.make_grant(record));
            }

            if timeout.is_zero() {
                Self::count_admission(&state, priority, "timeout");
                debug!(
                    task_id = %task_id,
                    vram_mb = vram_mb,
                    used_mb = state.ledger.used(),
                    "zero-timeout admission request cannot be satisfied"
                );
                return Err(GpuError::AdmissionTimeout {
                    requested_mb: vram_mb,
                    waited_ms: 0,
                });
            }

            let (tx, rx) = oneshot::channel();
            let waiter = Waiter {
                request_id: request_id.clone(),
                task_id: task_id.to_string(),
                vram_mb,
                priority,
                queued_at: Instant::now(),
                tx,
            };
            // Priority first, FIFO within a priority level: insert before
            // the first strictly lower-priority waiter.
            let position = state
                .queue
                .iter()
                .position(|w| w.priority > priority)
                .unwrap_or(state.queue.len());
            state.queue.insert(position, waiter);
            debug!(
                task_id = %task_id,
                request_id = %request_id,
                vram_mb = vram_mb,
                priority = %priority,
                position = position,
                queue_depth = state.queue.len(),
                "admission request queued"
            );
            Self::apply_gauges(&state);
            rx
        };

        // `&mut rx` keeps the receiver alive through the timeout so a
        // grant sent concurrently with the deadline is never lost.
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(record)) => Ok(self.make_grant(record)),
            Ok(Err(_)) => Err(GpuError::Internal(
                "admission waiter channel closed".to_string(),
            )),
            Err(_elapsed) => {
                let mut state = self.state.lock();
                if let Some(position) = state
                    .queue
                    .iter()
                    .position(|w| w.request_id == request_id)
                {
                    // Still queued: give up.
                    let waiter = state.queue.remove(position);
                    let waited_ms = waiter
                        .map(|w| w.queued_at.elapsed().as_millis() as u64)
                        .unwrap_or(timeout.as_millis() as u64);
                    Self::count_admission(&state, priority, "timeout");
                    Self::apply_gauges(&state);
                    warn!(
                        task_id = %task_id,
                        request_id = %request_id,
                        vram_mb = vram_mb,
                        waited_ms = waited_ms,
                        "admission request timed out"
                    );
                    Err(GpuError::AdmissionTimeout {
                        requested_mb: vram_mb,
                        waited_ms,
                    })
                } else {
                    // Granted in the race window between the deadline firing
                    // and this lock; the record is sitting in the channel.
                    drop(state);
                    match rx.try_recv() {
                        Ok(record) => Ok(self.make_grant(record)),
                        Err(_) => Err(GpuError::Internal(
                            "granted admission record missing from channel".to_string(),
                        )),
                    }
                }
            }
        }
    }

    /// Acquire without waiting: grant if capacity is free right now,
    /// otherwise fail with [`GpuError::AdmissionTimeout`].
    pub fn try_acquire(
        &self,
        task_id: &str,
        vram_mb: u64,
        priority: GrantPriority,
    ) -> GpuResult<GpuGrant> {
        let mut state = self.state.lock();

        if vram_mb > state.ledger.budget().allocatable() {
            Self::count_admission(&state, priority, "rejected");
            return Err(GpuError::AdmissionRejected {
                requested_mb: vram_mb,
                used_mb: state.ledger.used(),
                allocatable_mb: state.ledger.budget().allocatable(),
            });
        }
        if !state.ledger.can_admit(vram_mb) {
            Self::count_admission(&state, priority, "timeout");
            return Err(GpuError::AdmissionTimeout {
                requested_mb: vram_mb,
                waited_ms: 0,
            });
        }

        let request_id = Uuid::new_v4().to_string();
        let record = Self::admit_now(&mut state, &request_id, task_id, vram_mb, priority)?;
        Self::count_admission(&state, priority, "immediate");
        Self::apply_gauges(&state);
        drop(state);
        Ok(self.make_grant(record))
    }

    /// Release a grant and hand freed capacity to eligible waiters.
    ///
    /// Returns the number of MB freed.
    pub fn release(&self, mut grant: GpuGrant) -> GpuResult<u64> {
        grant.released = true;
        let request_id = grant.record.request_id.clone();
        drop(grant);
        self.release_request(&request_id)
    }

    /// Release by request id.
    ///
    /// Releasing an id that holds no grant is reported as
    /// [`GpuError::GrantNotHeld`], never silently ignored.
    pub fn release_request(&self, request_id: &str) -> GpuResult<u64> {
        let mut state = self.state.lock();
        let record = match state.ledger.release(request_id) {
            Ok(record) => record,
            Err(err) => {
                Self::count_release(&state, "not_held");
                return Err(err);
            }
        };
        Self::count_release(&state, "ok");
        info!(
            request_id = %request_id,
            task_id = %record.task_id,
            freed_mb = record.vram_mb,
            held_ms = record.acquired_at.elapsed().as_millis() as u64,
            used_mb = state.ledger.used(),
            "GPU grant released"
        );
        Self::admit_eligible(&mut state);
        Self::apply_gauges(&state);
        Ok(record.vram_mb)
    }

    /// Snapshot of budget, usage and queue state.
    pub fn utilization(&self) -> GpuUtilization {
        let state = self.state.lock();
        let budget = state.ledger.budget();
        let mut grants: Vec<GrantSnapshot> = state
            .ledger
            .records()
            .map(|r| GrantSnapshot {
                request_id: r.request_id.clone(),
                task_id: r.task_id.clone(),
                vram_mb: r.vram_mb,
                priority: r.priority,
                held_ms: r.acquired_at.elapsed().as_millis() as u64,
            })
            .collect();
        grants.sort_by(|a, b| b.held_ms.cmp(&a.held_ms));
        let queued: Vec<QueuedSnapshot> = state
            .queue
            .iter()
            .map(|w| QueuedSnapshot {
                request_id: w.request_id.clone(),
                task_id: w.task_id.clone(),
                vram_mb: w.vram_mb,
                priority: w.priority,
                waited_ms: w.queued_at.elapsed().as_millis() as u64,
            })
            .collect();

        GpuUtilization {
            total_mb: budget.total(),
            reserved_mb: budget.reserved(),
            allocatable_mb: budget.allocatable(),
            used_mb: state.ledger.used(),
            available_mb: state.ledger.available(),
            utilization_percent: state.ledger.utilization_percent(),
            active_grants: state.ledger.grant_count(),
            queued_requests: state.queue.len(),
            grants,
            queued,
        }
    }

    fn make_grant(&self, record: GrantRecord) -> GpuGrant {
        GpuGrant {
            record,
            state: Arc::clone(&self.state),
            released: false,
        }
    }

    fn admit_now(
        state: &mut ManagerState,
        request_id: &str,
        task_id: &str,
        vram_mb: u64,
        priority: GrantPriority,
    ) -> GpuResult<GrantRecord> {
        let record = GrantRecord {
            request_id: request_id.to_string(),
            task_id: task_id.to_string(),
            vram_mb,
            priority,
            acquired_at: Instant::now(),
        };
        state.ledger.admit(record.clone())?;
        Ok(record)
    }

    /// Walk the queue in priority/FIFO order and admit every waiter that
    /// fits the remaining capacity. Called with the state lock held.
    fn admit_eligible(state: &mut ManagerState) {
        // Abandoned waiters (receiver dropped) are swept first so they
        // cannot consume capacity.
        state.queue.retain(|w| !w.tx.is_closed());

        let mut index = 0;
        while index < state.queue.len() {
            if state.queue[index].vram_mb > state.ledger.available() {
                index += 1;
                continue;
            }
            let Some(waiter) = state.queue.remove(index) else {
                break;
            };
            let record = GrantRecord {
                request_id: waiter.request_id.clone(),
                task_id: waiter.task_id.clone(),
                vram_mb: waiter.vram_mb,
                priority: waiter.priority,
                acquired_at: Instant::now(),
            };
            match state.ledger.admit(record.clone()) {
                Ok(()) => {
                    Self::count_admission(state, waiter.priority, "queued");
                    Self::observe_wait(state, waiter.queued_at.elapsed());
                    debug!(
                        request_id = %record.request_id,
                        task_id = %record.task_id,
                        vram_mb = record.vram_mb,
                        waited_ms = waiter.queued_at.elapsed().as_millis() as u64,
                        "queued admission request granted"
                    );
                    if let Err(unclaimed) = waiter.tx.send(record) {
                        // Receiver vanished after the sweep; reclaim.
                        let _ = state.ledger.release(&unclaimed.request_id);
                    }
                }
                Err(err) => {
                    // Ledger said no despite the capacity check; put the
                    // waiter back and stop this scan.
                    warn!(error = %err, "queued admission failed unexpectedly");
                    state.queue.insert(index, waiter);
                    break;
                }
            }
        }
    }

    fn apply_gauges(state: &ManagerState) {
        if let Some(metrics) = &state.metrics {
            metrics.vram_used_mb.set(state.ledger.used() as i64);
            metrics.active_grants.set(state.ledger.grant_count() as i64);
            metrics.queue_depth.set(state.queue.len() as i64);
        }
    }

    fn count_admission(state: &ManagerState, priority: GrantPriority, outcome: &str) {
        if let Some(metrics) = &state.metrics {
            metrics
                .admissions_total
                .with_label_values(&[priority.as_str(), outcome])
                .inc();
        }
    }

    fn count_release(state: &ManagerState, outcome: &str) {
        if let Some(metrics) = &state.metrics {
            metrics.releases_total.with_label_values(&[outcome]).inc();
        }
    }

    fn observe_wait(state: &ManagerState, waited: Duration) {
        if let Some(metrics) = &state.metrics {
            metrics.admission_wait_seconds.observe(waited.as_secs_f64());
        }
    }
}

/// An admitted VRAM reservation.
///
/// Release through [`GpuResourceManager::release`]; dropping a grant
/// without releasing it is treated as a leak, logged, and reclaimed so
/// the budget cannot bleed away.
#[derive(Debug)]
pub struct GpuGrant {
    record: GrantRecord,
    state: Arc<Mutex<ManagerState>>,
    released: bool,
}

impl GpuGrant {
    pub fn request_id(&self) -> &str {
        &self.record.request_id
    }

    pub fn task_id(&self) -> &str {
        &self.record.task_id
    }

    pub fn vram_mb(&self) -> u64 {
        self.record.vram_mb
    }

    pub fn priority(&self) -> GrantPriority {
        self.record.priority
    }

    /// How long the grant has been held.
    pub fn held(&self) -> Duration {
        self.record.acquired_at.elapsed()
    }
}

impl Drop for GpuGrant {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.state.lock();
        warn!(
            request_id = %self.record.request_id,
            task_id = %self.record.task_id,
            vram_mb = self.record.vram_mb,
            "GPU grant dropped without release, reclaiming"
        );
        if state.ledger.release(&self.record.request_id).is_ok() {
            GpuResourceManager::count_release(&state, "leaked");
            GpuResourceManager::admit_eligible(&mut state);
            GpuResourceManager::apply_gauges(&state);
        }
    }
}
