//! Pipeline orchestration for Portray talking-head video generation.
//!
//! This crate connects the server's components into a complete run:
//!
//! - **PipelineController**: drives one task through its stage sequence
//! - **TaskRegistry**: status, results, and cancellation tokens by task id
//! - **WorkerService**: bounded submission queue and concurrency limits
//! - **Collaborator clients**: HTTP bindings for the three model services
//!
//! # Architecture
//!
//! ```text
//! Gateway                      Pipeline Crate
//! ┌─────────────────┐          ┌──────────────────────────────┐
//! │ POST /tasks     │──submit──▶│ WorkerService                │
//! │ POST /cancel    │          │   └── PipelineController     │
//! └─────────────────┘          │         ├── GPU admission    │
//!                              │         ├── ProgressBus      │
//!                              │         └── AssetStore       │
//!                              └──────────────────────────────┘
//!                                        │
//!               ┌────────────────────────┼────────────────────────┐
//!               ▼                        ▼                        ▼
//!      person-detection         background-matting        speech-synthesis
//!      ┌─────────────┐          ┌─────────────┐          ┌─────────────┐
//!      │ POST        │          │ POST        │          │ POST /jobs  │
//!      │ /v1/detect  │          │ /v1/matte   │          │ poll, fetch │
//!      └─────────────┘          └─────────────┘          └─────────────┘
//! ```
//!
//! # Stage Sequence
//!
//! Each run executes, publishing a progress event on entering and leaving
//! every stage:
//!
//! 1. **Load**: read the uploaded portrait and audio from the asset store
//! 2. **Detection**: find persons, select the subject (0-20%)
//! 3. **Matting**: remove the background around the subject (20-40%)
//! 4. **Synthesis**: render the lip-synced video (40-80%, optional)
//! 5. **Finalize**: persist the output asset (80-100%)
//!
//! GPU-bound stages hold a VRAM grant for exactly the span of the
//! collaborator call; every exit path releases it.

pub mod collab;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod selection;
pub mod stage;
pub mod worker;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use collab::{
    BackgroundMatter, DetectionClientConfig, HttpDetectionClient, HttpMattingClient,
    HttpSynthesisClient, MattingClientConfig, MattingOutput, PersonDetector, SpeechSynthesizer,
    SynthesisClientConfig, SynthesisOutput,
};
pub use controller::{PipelineConfig, PipelineController};
pub use error::{
    CollabResult, CollaboratorError, PipelineError, RegistryError, RegistryResult, StageResult,
    ValidationError, WorkerError,
};
pub use metrics::{MetricsError, PipelineMetrics};
pub use registry::{RegistryCounts, TaskRecord, TaskRegistry};
pub use selection::select_subject;
pub use stage::stage_percent;
pub use worker::{JobSubmitter, SubmittedJob, WorkerConfig, WorkerService};
