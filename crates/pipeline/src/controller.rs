//! Pipeline controller: drives one task through its stages.
//!
//! A run is a fixed sequence — load inputs, detect persons, remove the
//! background, synthesize the lip-synced video, persist the output — with a
//! progress event published when each stage begins and when it completes.
//! GPU-bound stages hold a VRAM grant for exactly the span of the
//! collaborator call. Cancellation is cooperative: the token is checked
//! between stages, never mid-call, so an in-flight inference is allowed to
//! finish and its output is discarded.
//!
//! `execute` is infallible by construction: every run ends with exactly one
//! terminal bus event (COMPLETE or ERROR) and exactly one `PipelineResult`,
//! whatever went wrong in between.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use portray_events::ProgressBus;
use portray_gpu::GpuResourceManager;
use portray_storage::{AssetKind, StorageManager, StoredAsset};
use portray_types::{EventType, PipelineOptions, PipelineProgress, PipelineResult, PipelineStage};

use crate::collab::{BackgroundMatter, PersonDetector, SpeechSynthesizer, SynthesisOutput};
use crate::error::{PipelineError, StageResult};
use crate::metrics::PipelineMetrics;
use crate::selection::select_subject;
use crate::stage::stage_percent;

/// Configuration for pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// VRAM estimate for the detection stage in MB.
    pub detection_vram_mb: u64,
    /// VRAM estimate for the matting stage in MB.
    pub matting_vram_mb: u64,
    /// VRAM estimate for the synthesis stage in MB.
    pub synthesis_vram_mb: u64,
    /// How long a stage may wait for GPU admission.
    pub admission_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_vram_mb: 2_000,
            matting_vram_mb: 3_000,
            synthesis_vram_mb: 6_000,
            admission_timeout: Duration::from_secs(30),
        }
    }
}

/// Orchestrates pipeline stages against the GPU manager, the event bus,
/// the asset store, and the three collaborator services.
pub struct PipelineController {
    config: PipelineConfig,
    gpu: GpuResourceManager,
    bus: ProgressBus,
    storage: StorageManager,
    detector: Arc<dyn PersonDetector>,
    matter: Arc<dyn BackgroundMatter>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl PipelineController {
    /// Create a new controller.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        gpu: GpuResourceManager,
        bus: ProgressBus,
        storage: StorageManager,
        detector: Arc<dyn PersonDetector>,
        matter: Arc<dyn BackgroundMatter>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            config,
            gpu,
            bus,
            storage,
            detector,
            matter,
            synthesizer,
            metrics: None,
        }
    }

    /// Attach execution metrics.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the controller configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the pipeline for one task.
    ///
    /// `image_asset` and `audio_asset` are ids of inputs already persisted
    /// to the asset store. Progress flows to the event bus under `task_id`;
    /// the returned result mirrors the terminal event.
    pub async fn execute(
        &self,
        task_id: &str,
        image_asset: &str,
        audio_asset: &str,
        options: &PipelineOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let started = Instant::now();
        if let Some(m) = &self.metrics {
            m.active_tasks.inc();
        }

        let mut reporter = StageReporter::new(&self.bus, task_id);
        let outcome = self
            .run_stages(&mut reporter, task_id, image_asset, audio_asset, options, cancel)
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Some(m) = &self.metrics {
            m.active_tasks.dec();
            m.task_duration_seconds.observe(started.elapsed().as_secs_f64());
        }

        match outcome {
            Ok(video_url) => {
                info!(
                    task_id = %task_id,
                    video_url = %video_url,
                    elapsed_ms,
                    "pipeline run completed"
                );
                if let Some(m) = &self.metrics {
                    m.tasks_total.with_label_values(&["completed"]).inc();
                }
                let result = PipelineResult::success(task_id, video_url, elapsed_ms);
                if let Err(e) = self.publish_completion(&mut reporter, &result) {
                    warn!(task_id = %task_id, error = %e, "failed to publish completion events");
                }
                result
            }
            Err(err) => {
                let cancelled = err.is_cancellation();
                let kind = err.kind();
                let public = err.public_message();
                if cancelled {
                    info!(task_id = %task_id, elapsed_ms, "pipeline run cancelled");
                } else {
                    warn!(
                        task_id = %task_id,
                        error = %err,
                        kind,
                        elapsed_ms,
                        "pipeline run failed"
                    );
                }
                if let Some(m) = &self.metrics {
                    let outcome = if cancelled { "cancelled" } else { "failed" };
                    m.tasks_total.with_label_values(&[outcome]).inc();
                    m.failures_total.with_label_values(&[kind]).inc();
                }
                let result = PipelineResult::failure(task_id, public.clone(), elapsed_ms);
                if let Err(e) = self.publish_failure(&mut reporter, cancelled, &public, kind) {
                    warn!(task_id = %task_id, error = %e, "failed to publish failure events");
                }
                result
            }
        }
    }

    /// The stage sequence proper. Returns the URL of the output asset.
    async fn run_stages(
        &self,
        reporter: &mut StageReporter<'_>,
        task_id: &str,
        image_asset: &str,
        audio_asset: &str,
        options: &PipelineOptions,
        cancel: &CancellationToken,
    ) -> StageResult<String> {
        // A cancel that landed while the job sat in the queue is honored
        // before any work starts.
        checkpoint(cancel)?;
        reporter.advance(PipelineStage::Initialized, "task accepted", json!({}))?;

        // 1. Load inputs from the asset store.
        let step_started = Instant::now();
        info!(
            task_id = %task_id,
            image = %image_asset,
            audio = %audio_asset,
            "Step 1/5: loading inputs"
        );
        let image = self.storage.get(image_asset).await?;
        let audio = self.storage.get(audio_asset).await?;
        reporter.advance(
            PipelineStage::UploadComplete,
            "inputs loaded",
            json!({ "image_bytes": image.len(), "audio_bytes": audio.len() }),
        )?;
        self.observe_stage("load", step_started);
        checkpoint(cancel)?;

        // 2. Person detection.
        let step_started = Instant::now();
        info!(task_id = %task_id, "Step 2/5: person detection");
        reporter.advance(PipelineStage::DetectionRunning, "detecting persons", json!({}))?;
        let grant = self
            .gpu
            .acquire(
                task_id,
                self.config.detection_vram_mb,
                options.priority,
                self.config.admission_timeout,
            )
            .await?;
        let detect_result = self.detector.detect(&image).await;
        self.gpu.release(grant)?;
        let detections = detect_result?;
        let (subject_index, subject) = select_subject(
            &detections,
            options.selection,
            options.thresholds.min_detection_confidence,
        )?;
        reporter.advance(
            PipelineStage::DetectionComplete,
            format!("selected person {} of {}", subject_index + 1, detections.len()),
            json!({
                "detections": detections.len(),
                "subject_index": subject_index,
                "confidence": subject.confidence,
                "bbox": subject.bbox,
            }),
        )?;
        self.observe_stage("detection", step_started);
        checkpoint(cancel)?;

        // 3. Background removal.
        let step_started = Instant::now();
        info!(task_id = %task_id, "Step 3/5: background removal");
        reporter.advance(
            PipelineStage::BackgroundRemovalRunning,
            "removing background",
            json!({}),
        )?;
        let grant = self
            .gpu
            .acquire(
                task_id,
                self.config.matting_vram_mb,
                options.priority,
                self.config.admission_timeout,
            )
            .await?;
        let matte_result = self.matter.remove_background(&image, &subject.bbox).await;
        self.gpu.release(grant)?;
        let matting = matte_result?;
        let matte_asset = self.storage.put(AssetKind::Matte, &matting.image).await?;
        reporter.advance(
            PipelineStage::BackgroundRemovalComplete,
            "background removed",
            json!({
                "matte_asset": matte_asset.id,
                "mask_coverage": matting.mask_coverage,
            }),
        )?;
        self.observe_stage("matting", step_started);
        checkpoint(cancel)?;

        // 4. Lip-sync synthesis, unless this is a matting-only run.
        let render: Option<SynthesisOutput> = if options.synthesize {
            let step_started = Instant::now();
            info!(task_id = %task_id, "Step 4/5: lip-sync synthesis");
            reporter.advance(
                PipelineStage::SynthesisRunning,
                "rendering lip-synced video",
                json!({}),
            )?;
            let grant = self
                .gpu
                .acquire(
                    task_id,
                    self.config.synthesis_vram_mb,
                    options.priority,
                    self.config.admission_timeout,
                )
                .await?;
            let synth_result = self.synthesizer.synthesize(&matting.image, &audio).await;
            self.gpu.release(grant)?;
            let synthesis = synth_result?;
            reporter.advance(
                PipelineStage::SynthesisComplete,
                "render finished",
                json!({
                    "render_time_ms": synthesis.render_time_ms,
                    "video_bytes": synthesis.video.len(),
                }),
            )?;
            self.observe_stage("synthesis", step_started);
            checkpoint(cancel)?;
            Some(synthesis)
        } else {
            info!(task_id = %task_id, "Step 4/5: synthesis disabled, skipping");
            None
        };

        // 5. Finalize: the matting-only output is the matte itself.
        let step_started = Instant::now();
        info!(task_id = %task_id, "Step 5/5: finalizing output");
        reporter.advance(PipelineStage::Finalizing, "persisting output", json!({}))?;
        let output_asset: StoredAsset = match &render {
            Some(synthesis) => self.storage.put(AssetKind::Video, &synthesis.video).await?,
            None => matte_asset.clone(),
        };
        self.observe_stage("finalize", step_started);

        Ok(format!("/api/v1/assets/{}", output_asset.id))
    }

    fn publish_completion(
        &self,
        reporter: &mut StageReporter<'_>,
        result: &PipelineResult,
    ) -> StageResult<()> {
        reporter.advance(
            PipelineStage::Completed,
            "video ready",
            json!({ "video_url": result.video_url }),
        )?;
        self.bus.publish(
            &result.task_id,
            EventType::Complete,
            serde_json::to_value(result)?,
        )?;
        Ok(())
    }

    fn publish_failure(
        &self,
        reporter: &mut StageReporter<'_>,
        cancelled: bool,
        public: &str,
        kind: &str,
    ) -> StageResult<()> {
        let stage = if cancelled {
            PipelineStage::Cancelled
        } else {
            PipelineStage::Failed
        };
        // The terminal ERROR goes out even if the stage update is rejected.
        let stage_outcome = reporter.advance(stage, public, json!({ "kind": kind }));
        self.bus.publish(
            reporter.task_id,
            EventType::Error,
            json!({ "error": public, "kind": kind, "stage": stage.as_str() }),
        )?;
        stage_outcome
    }

    fn observe_stage(&self, stage: &str, started: Instant) {
        if let Some(m) = &self.metrics {
            m.stage_duration_seconds
                .with_label_values(&[stage])
                .observe(started.elapsed().as_secs_f64());
        }
    }
}

fn checkpoint(cancel: &CancellationToken) -> StageResult<()> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

/// Publishes stage transitions and keeps the reported percent monotonic.
struct StageReporter<'a> {
    bus: &'a ProgressBus,
    task_id: &'a str,
    stage: Option<PipelineStage>,
    last_percent: u8,
}

impl<'a> StageReporter<'a> {
    fn new(bus: &'a ProgressBus, task_id: &'a str) -> Self {
        Self {
            bus,
            task_id,
            stage: None,
            last_percent: 0,
        }
    }

    /// Move to `stage` and publish the STAGE_UPDATE for it.
    ///
    /// Failure stages carry no percent of their own and report the last
    /// one reached; all other stages report their window boundary, clamped
    /// so the stream never goes backwards.
    fn advance(
        &mut self,
        stage: PipelineStage,
        message: impl Into<String>,
        metadata: Value,
    ) -> StageResult<()> {
        if let Some(current) = self.stage {
            if !current.can_transition_to(stage) {
                return Err(PipelineError::Internal(format!(
                    "invalid stage transition from {current} to {stage}"
                )));
            }
        }

        let percent = stage_percent(stage)
            .unwrap_or(self.last_percent)
            .max(self.last_percent);
        let progress = PipelineProgress::new(stage, percent, message).with_metadata(metadata);
        self.bus.publish(
            self.task_id,
            EventType::StageUpdate,
            serde_json::to_value(&progress)?,
        )?;

        self.stage = Some(stage);
        self.last_percent = percent;
        Ok(())
    }
}
