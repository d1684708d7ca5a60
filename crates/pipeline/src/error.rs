//! Error types for pipeline orchestration.
//!
//! `PipelineError` is the top-level error for a pipeline run and aggregates
//! the failure modes of every stage: input validation, GPU admission,
//! collaborator calls, asset storage, and event publication. Collaborator
//! failures are always one of `ServiceUnavailable`, `InferenceError`, or
//! `Timeout` so callers can distinguish "retry later" from "the model said no".

use thiserror::Error;

use portray_events::BusError;
use portray_gpu::GpuError;
use portray_storage::StorageError;

/// Top-level error for pipeline execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Request inputs failed validation.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// GPU admission failed (timeout, rejection, or ledger fault).
    #[error("gpu admission: {0}")]
    Gpu(#[from] GpuError),

    /// A collaborator service call failed.
    #[error("collaborator: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// No usable person detection in the portrait image.
    #[error("no subject found: {0}")]
    NoSubjectFound(String),

    /// Asset store read or write failed.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// Progress event could not be published.
    #[error("event bus: {0}")]
    Bus(#[from] BusError),

    /// JSON encoding of an event payload failed.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The task was cancelled at a stage boundary.
    #[error("task cancelled")]
    Cancelled,

    /// Invariant violation inside the orchestrator itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Short stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Gpu(GpuError::AdmissionTimeout { .. }) => "admission_timeout",
            Self::Gpu(GpuError::AdmissionRejected { .. }) => "admission_rejected",
            Self::Gpu(_) => "gpu",
            Self::Collaborator(CollaboratorError::ServiceUnavailable { .. }) => {
                "service_unavailable"
            }
            Self::Collaborator(CollaboratorError::InferenceError { .. }) => "inference_error",
            Self::Collaborator(CollaboratorError::Timeout { .. }) => "collaborator_timeout",
            Self::NoSubjectFound(_) => "no_subject",
            Self::Storage(_) => "storage",
            Self::Bus(_) => "bus",
            Self::Serialization(_) => "serialization",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Client-safe description of the failure.
    ///
    /// Collaborator reasons can embed endpoint URLs or upstream response
    /// bodies, and storage errors can embed filesystem paths. Those stay in
    /// the logs; this is what goes into ERROR events and API responses.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(e) => e.to_string(),
            Self::Gpu(GpuError::AdmissionTimeout { waited_ms, .. }) => {
                format!("gpu capacity unavailable after waiting {}ms", waited_ms)
            }
            Self::Gpu(GpuError::AdmissionRejected { requested_mb, .. }) => {
                format!("requested {}MB of vram exceeds server capacity", requested_mb)
            }
            Self::Gpu(_) => "internal gpu accounting error".to_string(),
            Self::Collaborator(CollaboratorError::ServiceUnavailable { service, .. }) => {
                format!("{} service unavailable", service)
            }
            Self::Collaborator(CollaboratorError::InferenceError { service, .. }) => {
                format!("{} inference failed", service)
            }
            Self::Collaborator(CollaboratorError::Timeout {
                service,
                timeout_ms,
            }) => {
                format!("{} did not respond within {}ms", service, timeout_ms)
            }
            Self::NoSubjectFound(detail) => format!("no subject found: {}", detail),
            Self::Storage(_) => "internal storage error".to_string(),
            Self::Bus(_) | Self::Serialization(_) | Self::Internal(_) => {
                "internal error".to_string()
            }
            Self::Cancelled => "task cancelled".to_string(),
        }
    }

    /// True when the failure was a client cancellation rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Request input validation failures.
///
/// These are client errors: the gateway maps them to HTTP 400 and their
/// display text is safe to return verbatim.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{field}'")]
    MissingField { field: &'static str },

    #[error("field '{field}' is empty")]
    Empty { field: &'static str },

    #[error("field '{field}' is {actual} bytes, limit is {limit}")]
    TooLarge {
        field: &'static str,
        actual: usize,
        limit: usize,
    },

    #[error("field '{field}' is not valid base64")]
    InvalidBase64 { field: &'static str },

    #[error("person index {index} out of range ({count} detections)")]
    PersonIndexOutOfRange { index: usize, count: usize },
}

/// Failures reported by collaborator model services.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The service is unreachable or refusing work.
    #[error("{service} unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// The service ran the model and the model failed.
    #[error("{service} inference error: {reason}")]
    InferenceError { service: String, reason: String },

    /// No response within the configured deadline.
    #[error("{service} timed out after {timeout_ms}ms")]
    Timeout { service: String, timeout_ms: u64 },
}

impl CollaboratorError {
    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn inference(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InferenceError {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(service: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            service: service.into(),
            timeout_ms,
        }
    }

    /// Name of the collaborator that failed.
    pub fn service(&self) -> &str {
        match self {
            Self::ServiceUnavailable { service, .. }
            | Self::InferenceError { service, .. }
            | Self::Timeout { service, .. } => service,
        }
    }

    /// Map a transport-level `reqwest` error onto the collaborator contract.
    ///
    /// Deadline expiry becomes `Timeout`; everything else (refused
    /// connection, DNS failure, broken body) is `ServiceUnavailable`.
    pub fn from_transport(service: &str, timeout_ms: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(service, timeout_ms)
        } else {
            Self::unavailable(service, err.to_string())
        }
    }
}

/// Task registry lookup failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("task '{0}' not found")]
    NotFound(String),

    #[error("task '{0}' already finished")]
    AlreadyFinished(String),
}

/// Job submission failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The submission queue is at capacity.
    #[error("job queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// The worker loop has shut down.
    #[error("worker is shutting down")]
    ShuttingDown,
}

/// Result alias for pipeline stage execution.
pub type StageResult<T> = Result<T, PipelineError>;

/// Result alias for collaborator calls.
pub type CollabResult<T> = Result<T, CollaboratorError>;

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
