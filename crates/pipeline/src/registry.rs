//! In-memory registry of submitted tasks.
//!
//! The registry is the polling surface: it answers "what is task X right
//! now" without touching the event bus. Terminal records stick around for a
//! retention window so status queries keep working after completion, then
//! get pruned by the worker's maintenance tick.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use portray_types::{unix_ms, PipelineOptions, PipelineResult, TaskStatus};

use crate::error::{RegistryError, RegistryResult};

/// Snapshot of a task's registry state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip)]
    pub options: PipelineOptions,
    #[serde(skip)]
    pub image_asset: String,
    #[serde(skip)]
    pub audio_asset: String,
    pub submitted_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PipelineResult>,
}

struct TaskEntry {
    record: TaskRecord,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

/// Task counts by lifecycle phase.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistryCounts {
    pub queued: usize,
    pub running: usize,
    pub finished: usize,
}

/// Registry of every task the server currently remembers.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task in `Queued` state and return its cancellation token.
    ///
    /// Task ids are caller-generated UUIDs; a duplicate insert keeps the
    /// existing entry and hands back its token.
    pub fn insert(
        &self,
        task_id: &str,
        options: PipelineOptions,
        image_asset: String,
        audio_asset: String,
    ) -> CancellationToken {
        let mut tasks = self.tasks.write();
        if let Some(existing) = tasks.get(task_id) {
            warn!(task_id = %task_id, "duplicate task id on insert, keeping existing entry");
            return existing.cancel.clone();
        }

        let cancel = CancellationToken::new();
        tasks.insert(
            task_id.to_string(),
            TaskEntry {
                record: TaskRecord {
                    task_id: task_id.to_string(),
                    status: TaskStatus::Queued,
                    options,
                    image_asset,
                    audio_asset,
                    submitted_at_ms: unix_ms(),
                    result: None,
                },
                cancel: cancel.clone(),
                finished_at: None,
            },
        );
        cancel
    }

    /// Snapshot a task's record.
    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.tasks.read().get(task_id).map(|e| e.record.clone())
    }

    /// Get the cancellation token for a task.
    pub fn cancel_token(&self, task_id: &str) -> Option<CancellationToken> {
        self.tasks.read().get(task_id).map(|e| e.cancel.clone())
    }

    /// Transition a queued task to `Running`.
    pub fn mark_running(&self, task_id: &str) {
        let mut tasks = self.tasks.write();
        match tasks.get_mut(task_id) {
            Some(entry) if entry.record.status == TaskStatus::Queued => {
                entry.record.status = TaskStatus::Running;
            }
            Some(entry) => {
                warn!(
                    task_id = %task_id,
                    status = %entry.record.status,
                    "mark_running on task not in queued state"
                );
            }
            None => warn!(task_id = %task_id, "mark_running on unknown task"),
        }
    }

    /// Record a task's terminal status and result.
    ///
    /// A task finishes exactly once; a second call is ignored with a warning
    /// so the first result is never overwritten.
    pub fn complete(&self, task_id: &str, status: TaskStatus, result: PipelineResult) {
        let mut tasks = self.tasks.write();
        let Some(entry) = tasks.get_mut(task_id) else {
            warn!(task_id = %task_id, "complete on unknown task");
            return;
        };
        if entry.record.status.is_terminal() {
            warn!(
                task_id = %task_id,
                status = %entry.record.status,
                "complete on already finished task, ignoring"
            );
            return;
        }
        debug!(task_id = %task_id, status = %status, "task finished");
        entry.record.status = status;
        entry.record.result = Some(result);
        entry.finished_at = Some(Instant::now());
    }

    /// Request cancellation of a task.
    ///
    /// Cancels the task's token; the pipeline observes it at the next stage
    /// boundary. Queued tasks are cancelled before their first stage runs.
    ///
    /// # Errors
    /// `NotFound` for unknown ids, `AlreadyFinished` for terminal tasks.
    pub fn request_cancel(&self, task_id: &str) -> RegistryResult<()> {
        let tasks = self.tasks.read();
        let entry = tasks
            .get(task_id)
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))?;
        if entry.record.status.is_terminal() {
            return Err(RegistryError::AlreadyFinished(task_id.to_string()));
        }
        entry.cancel.cancel();
        debug!(task_id = %task_id, "cancellation requested");
        Ok(())
    }

    /// Task counts by lifecycle phase.
    pub fn counts(&self) -> RegistryCounts {
        let tasks = self.tasks.read();
        let mut counts = RegistryCounts::default();
        for entry in tasks.values() {
            match entry.record.status {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Running => counts.running += 1,
                _ => counts.finished += 1,
            }
        }
        counts
    }

    /// Drop terminal records older than `retention`. Returns how many went.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, entry| match entry.finished_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        let pruned = before - tasks.len();
        if pruned > 0 {
            debug!(pruned, remaining = tasks.len(), "pruned finished tasks");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}
