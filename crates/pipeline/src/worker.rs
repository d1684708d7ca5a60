//! Background worker that turns submitted jobs into pipeline runs.
//!
//! Submission is a bounded channel: the gateway enqueues without blocking
//! and gets `QueueFull` when the backlog is at capacity. The worker loop
//! dequeues jobs, waits for one of a fixed number of execution slots, and
//! spawns the run. Registry bookkeeping (Queued -> Running -> terminal)
//! happens here so the controller stays ignorant of the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use portray_types::{PipelineOptions, TaskStatus};

use crate::controller::PipelineController;
use crate::error::WorkerError;
use crate::metrics::PipelineMetrics;
use crate::registry::TaskRegistry;

/// Configuration for the worker service.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Capacity of the submission queue.
    pub queue_capacity: usize,
    /// Maximum pipeline runs executing at once.
    pub concurrency: usize,
    /// How long finished tasks stay queryable in the registry.
    pub registry_retention: Duration,
    /// Registry prune cadence.
    pub prune_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            concurrency: 2,
            registry_retention: Duration::from_secs(3600),
            prune_interval: Duration::from_secs(60),
        }
    }
}

/// A job accepted for execution.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub task_id: String,
    pub image_asset: String,
    pub audio_asset: String,
    pub options: PipelineOptions,
}

/// Enqueues jobs onto the worker. Held by the gateway; cloning is cheap.
#[derive(Clone)]
pub struct JobSubmitter {
    tx: mpsc::Sender<SubmittedJob>,
    capacity: usize,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl JobSubmitter {
    /// Enqueue a job without blocking.
    ///
    /// # Errors
    /// `QueueFull` when the backlog is at capacity, `ShuttingDown` once the
    /// worker loop has exited.
    pub fn submit(&self, job: SubmittedJob) -> Result<(), WorkerError> {
        match self.tx.try_send(job) {
            Ok(()) => {
                if let Some(m) = &self.metrics {
                    m.queue_depth.inc();
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(WorkerError::QueueFull {
                capacity: self.capacity,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkerError::ShuttingDown),
        }
    }
}

/// The worker loop. Construct with [`WorkerService::new`], then hand the
/// service to a task running [`WorkerService::run`].
pub struct WorkerService {
    config: WorkerConfig,
    controller: Arc<PipelineController>,
    registry: Arc<TaskRegistry>,
    rx: mpsc::Receiver<SubmittedJob>,
    slots: Arc<Semaphore>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl WorkerService {
    /// Create the worker and its submission handle.
    pub fn new(
        config: WorkerConfig,
        controller: Arc<PipelineController>,
        registry: Arc<TaskRegistry>,
        metrics: Option<Arc<PipelineMetrics>>,
    ) -> (Self, JobSubmitter) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let submitter = JobSubmitter {
            tx,
            capacity: config.queue_capacity,
            metrics: metrics.clone(),
        };
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        (
            Self {
                config,
                controller,
                registry,
                rx,
                slots,
                metrics,
            },
            submitter,
        )
    }

    /// Run until `shutdown` fires or every submitter is dropped.
    ///
    /// Queued jobs that never started are dropped on shutdown; runs already
    /// in flight keep going on their spawned tasks and finish through the
    /// normal terminal path.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            concurrency = self.config.concurrency,
            queue_capacity = self.config.queue_capacity,
            "worker started"
        );

        let mut prune_tick = tokio::time::interval(self.config.prune_interval);
        prune_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("worker shutting down");
                    break;
                }
                _ = prune_tick.tick() => {
                    self.registry.prune_finished(self.config.registry_retention);
                }
                maybe_job = self.rx.recv() => {
                    let Some(job) = maybe_job else {
                        debug!("submission channel closed");
                        break;
                    };
                    if let Some(m) = &self.metrics {
                        m.queue_depth.dec();
                    }

                    let permit = tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("worker shutting down");
                            break;
                        }
                        permit = Arc::clone(&self.slots).acquire_owned() => {
                            let Ok(permit) = permit else { break };
                            permit
                        }
                    };

                    let controller = Arc::clone(&self.controller);
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        let _slot = permit;
                        run_job(controller, registry, job).await;
                    });
                }
            }
        }
    }
}

async fn run_job(
    controller: Arc<PipelineController>,
    registry: Arc<TaskRegistry>,
    job: SubmittedJob,
) {
    let Some(cancel) = registry.cancel_token(&job.task_id) else {
        warn!(task_id = %job.task_id, "job has no registry entry, dropping");
        return;
    };

    registry.mark_running(&job.task_id);
    debug!(task_id = %job.task_id, "job started");

    let result = controller
        .execute(
            &job.task_id,
            &job.image_asset,
            &job.audio_asset,
            &job.options,
            &cancel,
        )
        .await;

    let status = if result.success {
        TaskStatus::Completed
    } else if cancel.is_cancelled() {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Failed
    };
    registry.complete(&job.task_id, status, result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{PipelineConfig, PipelineController};
    use crate::registry::TaskRecord;
    use crate::testing::{detection, MockDetector, MockMatter, MockSynthesizer};
    use portray_events::{BusConfig, ProgressBus};
    use portray_gpu::{GpuResourceManager, VramBudget};
    use portray_storage::{AssetKind, StorageManager};

    struct Harness {
        controller: Arc<PipelineController>,
        registry: Arc<TaskRegistry>,
        image_id: String,
        audio_id: String,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::local(dir.path().to_path_buf()).unwrap();
        let image_id = storage.put(AssetKind::Image, b"img").await.unwrap().id;
        let audio_id = storage.put(AssetKind::Audio, b"wav").await.unwrap().id;

        let controller = Arc::new(PipelineController::new(
            PipelineConfig::default(),
            GpuResourceManager::new(VramBudget::with_reserved(12_000, 0)),
            ProgressBus::new(BusConfig::default()),
            storage,
            Arc::new(MockDetector::returning(vec![detection(50.0, 50.0, 0.9)])),
            Arc::new(MockMatter::succeeding()),
            Arc::new(MockSynthesizer::succeeding()),
        ));

        Harness {
            controller,
            registry: Arc::new(TaskRegistry::new()),
            image_id,
            audio_id,
            _dir: dir,
        }
    }

    fn job(h: &Harness, task_id: &str) -> SubmittedJob {
        SubmittedJob {
            task_id: task_id.to_string(),
            image_asset: h.image_id.clone(),
            audio_asset: h.audio_id.clone(),
            options: PipelineOptions::default(),
        }
    }

    async fn wait_terminal(registry: &TaskRegistry, task_id: &str) -> TaskRecord {
        for _ in 0..200 {
            if let Some(record) = registry.get(task_id) {
                if record.status.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {task_id} never reached a terminal status");
    }

    #[tokio::test]
    async fn test_submitted_job_runs_to_completion() {
        let h = harness().await;
        let (service, submitter) = WorkerService::new(
            WorkerConfig::default(),
            Arc::clone(&h.controller),
            Arc::clone(&h.registry),
            None,
        );

        let shutdown = CancellationToken::new();
        tokio::spawn(service.run(shutdown.clone()));

        h.registry.insert(
            "t1",
            PipelineOptions::default(),
            h.image_id.clone(),
            h.audio_id.clone(),
        );
        submitter.submit(job(&h, "t1")).unwrap();

        let record = wait_terminal(&h.registry, "t1").await;
        assert_eq!(record.status, TaskStatus::Completed);
        let result = record.result.unwrap();
        assert!(result.success);
        assert!(result.video_url.unwrap().starts_with("/api/v1/assets/video-"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_queue_full_rejects_submission() {
        let h = harness().await;
        let (_service, submitter) = WorkerService::new(
            WorkerConfig {
                queue_capacity: 1,
                ..WorkerConfig::default()
            },
            Arc::clone(&h.controller),
            Arc::clone(&h.registry),
            None,
        );
        // No worker loop running, so the first job sits in the queue.
        submitter.submit(job(&h, "t1")).unwrap();
        let err = submitter.submit(job(&h, "t2")).unwrap_err();
        assert_eq!(err, WorkerError::QueueFull { capacity: 1 });
    }

    #[tokio::test]
    async fn test_cancel_before_start_yields_cancelled_status() {
        let h = harness().await;
        let (service, submitter) = WorkerService::new(
            WorkerConfig::default(),
            Arc::clone(&h.controller),
            Arc::clone(&h.registry),
            None,
        );

        h.registry.insert(
            "t1",
            PipelineOptions::default(),
            h.image_id.clone(),
            h.audio_id.clone(),
        );
        submitter.submit(job(&h, "t1")).unwrap();
        // Cancel lands while the job is still queued: the worker has not
        // started yet.
        h.registry.request_cancel("t1").unwrap();

        let shutdown = CancellationToken::new();
        tokio::spawn(service.run(shutdown.clone()));

        let record = wait_terminal(&h.registry, "t1").await;
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert_eq!(record.result.unwrap().error.unwrap(), "task cancelled");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_closes_submissions() {
        let h = harness().await;
        let (service, submitter) = WorkerService::new(
            WorkerConfig::default(),
            Arc::clone(&h.controller),
            Arc::clone(&h.registry),
            None,
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(service.run(shutdown.clone()));
        shutdown.cancel();
        handle.await.unwrap();

        // The loop dropped the receiver, so submission now fails.
        let err = submitter.submit(job(&h, "t1")).unwrap_err();
        assert_eq!(err, WorkerError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_unregistered_job_is_dropped() {
        let h = harness().await;
        let (service, submitter) = WorkerService::new(
            WorkerConfig::default(),
            Arc::clone(&h.controller),
            Arc::clone(&h.registry),
            None,
        );

        let shutdown = CancellationToken::new();
        tokio::spawn(service.run(shutdown.clone()));

        // Never inserted into the registry.
        submitter.submit(job(&h, "ghost")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.registry.get("ghost").is_none());

        shutdown.cancel();
    }
}
