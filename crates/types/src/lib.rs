//! Core types for the Portray orchestration node
//!
//! This crate provides the shared vocabulary used across all Portray
//! components: pipeline stages, progress events, admission priorities and
//! the request/result envelopes exchanged between the gateway, the
//! pipeline controller and the event bus.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline lifecycle stage.
///
/// The stage set is closed and ordered; `Failed` and `Cancelled` are
/// absorbing and reachable from any non-terminal stage. Synthesis stages
/// are skipped (never removed) when a request disables video synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    /// Task accepted, nothing started
    Initialized,
    /// Input assets persisted and readable
    UploadComplete,
    /// Person detection in flight
    DetectionRunning,
    /// Person detection finished, subject selected
    DetectionComplete,
    /// Background matting in flight
    BackgroundRemovalRunning,
    /// Background matting finished
    BackgroundRemovalComplete,
    /// Lip-sync synthesis in flight
    SynthesisRunning,
    /// Lip-sync synthesis finished
    SynthesisComplete,
    /// Assembling and persisting the output video
    Finalizing,
    /// Terminal: output available
    Completed,
    /// Terminal: pipeline failed
    Failed,
    /// Terminal: cancelled on request
    Cancelled,
}

impl PipelineStage {
    /// Wire name (SCREAMING_SNAKE_CASE), identical to the serde encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Initialized => "INITIALIZED",
            PipelineStage::UploadComplete => "UPLOAD_COMPLETE",
            PipelineStage::DetectionRunning => "DETECTION_RUNNING",
            PipelineStage::DetectionComplete => "DETECTION_COMPLETE",
            PipelineStage::BackgroundRemovalRunning => "BACKGROUND_REMOVAL_RUNNING",
            PipelineStage::BackgroundRemovalComplete => "BACKGROUND_REMOVAL_COMPLETE",
            PipelineStage::SynthesisRunning => "SYNTHESIS_RUNNING",
            PipelineStage::SynthesisComplete => "SYNTHESIS_COMPLETE",
            PipelineStage::Finalizing => "FINALIZING",
            PipelineStage::Completed => "COMPLETED",
            PipelineStage::Failed => "FAILED",
            PipelineStage::Cancelled => "CANCELLED",
        }
    }

    /// Whether this stage ends the task (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStage::Completed | PipelineStage::Failed | PipelineStage::Cancelled
        )
    }

    /// Validate a stage transition.
    ///
    /// Forward transitions follow the fixed stage order;
    /// `BackgroundRemovalComplete -> Finalizing` is the synthesis-skip
    /// branch. Any non-terminal stage may move to `Failed` or `Cancelled`.
    pub fn can_transition_to(&self, next: PipelineStage) -> bool {
        use PipelineStage::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Initialized, UploadComplete)
                | (UploadComplete, DetectionRunning)
                | (DetectionRunning, DetectionComplete)
                | (DetectionComplete, BackgroundRemovalRunning)
                | (BackgroundRemovalRunning, BackgroundRemovalComplete)
                | (BackgroundRemovalComplete, SynthesisRunning)
                | (BackgroundRemovalComplete, Finalizing)
                | (SynthesisRunning, SynthesisComplete)
                | (SynthesisComplete, Finalizing)
                | (Finalizing, Completed)
        )
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress event kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Stage entry/exit or intra-stage progress
    StageUpdate,
    /// Terminal: task succeeded
    Complete,
    /// Terminal: task failed or was cancelled
    Error,
    /// Liveness signal for long-lived connections
    Heartbeat,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StageUpdate => "STAGE_UPDATE",
            EventType::Complete => "COMPLETE",
            EventType::Error => "ERROR",
            EventType::Heartbeat => "HEARTBEAT",
        }
    }

    /// Terminal events end the per-task stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Complete | EventType::Error)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit on the progress wire, fanned out to every subscriber of a task.
///
/// `seq` is the per-task publish ordinal assigned by the event bus; within
/// a task, delivery order matches `seq` order for every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Owning task
    pub task_id: String,
    /// Event kind
    pub event_type: EventType,
    /// Kind-specific payload (progress snapshot, result, error)
    pub data: serde_json::Value,
    /// Publish time, ms since Unix epoch
    pub timestamp: u64,
    /// Per-task publish ordinal, starting at 0
    pub seq: u64,
}

impl ProgressEvent {
    /// Terminal events end the per-task stream.
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

/// Immutable progress snapshot published before and after every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineProgress {
    /// Current stage
    pub stage: PipelineStage,
    /// Overall completion, 0-100, non-decreasing within a task
    pub progress_percent: u8,
    /// Human-readable status line
    pub message: String,
    /// Stage-specific details (detection count, frame counts, ...)
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Snapshot time, ms since Unix epoch
    pub timestamp: u64,
}

impl PipelineProgress {
    pub fn new(stage: PipelineStage, progress_percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            progress_percent,
            message: message.into(),
            metadata: serde_json::Value::Null,
            timestamp: unix_ms(),
        }
    }

    /// Attach stage-specific metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Terminal outcome of a pipeline run, produced exactly once per task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Owning task
    pub task_id: String,
    /// Whether the pipeline completed
    pub success: bool,
    /// Download URL for the rendered video (success only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    /// Public failure description (failure only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration of the run
    pub execution_time_ms: u64,
}

impl PipelineResult {
    pub fn success(task_id: impl Into<String>, video_url: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            video_url: Some(video_url.into()),
            error: None,
            execution_time_ms,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            video_url: None,
            error: Some(error.into()),
            execution_time_ms,
        }
    }
}

/// GPU admission priority.
///
/// Lower value admits first; requests of equal priority are served FIFO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantPriority {
    /// User is watching: jumps the queue
    Interactive = 0,
    /// Standard submissions
    #[default]
    Normal = 1,
    /// Bulk/offline work, admitted when nothing else waits
    Batch = 2,
}

impl GrantPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantPriority::Interactive => "interactive",
            GrantPriority::Normal => "normal",
            GrantPriority::Batch => "batch",
        }
    }
}

impl fmt::Display for GrantPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Registry-level task status, coarser than [`PipelineStage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, waiting for a worker slot
    Queued,
    /// Pipeline executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl TaskStatus {
    /// Wire name (snake_case), identical to the serde encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Axis-aligned bounding box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// One detected person candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Subject choice when detection returns multiple candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonSelection {
    /// Largest bounding-box area, earliest detection wins ties
    #[default]
    LargestBoundingBox,
    /// Explicit zero-based index into the detection list
    Index(usize),
}

/// Per-stage quality thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageThresholds {
    /// Detections below this confidence are discarded before selection
    pub min_detection_confidence: f32,
}

impl Default for StageThresholds {
    fn default() -> Self {
        Self {
            min_detection_confidence: 0.5,
        }
    }
}

/// Per-request pipeline options carried from submission to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Subject choice among detected persons
    #[serde(default)]
    pub selection: PersonSelection,
    /// Run the lip-sync synthesis stage (disable for matting-only previews)
    #[serde(default = "default_true")]
    pub synthesize: bool,
    /// Quality thresholds
    #[serde(default)]
    pub thresholds: StageThresholds,
    /// GPU admission priority for this task's stages
    #[serde(default)]
    pub priority: GrantPriority,
}

fn default_true() -> bool {
    true
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            selection: PersonSelection::default(),
            synthesize: true,
            thresholds: StageThresholds::default(),
            priority: GrantPriority::default(),
        }
    }
}

/// Current time as milliseconds since the Unix epoch.
pub fn unix_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
