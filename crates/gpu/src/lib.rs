//! VRAM admission control for a shared accelerator.
//!
//! Concurrent pipeline stages each need a slice of GPU memory. This crate
//! serializes those demands: a budget says how much VRAM may be handed
//! out, a ledger records every outstanding grant, and the manager parks
//! requests that do not fit in a priority/FIFO queue until capacity frees
//! up or their timeout expires.
//!
//! # Components
//!
//! - [`VramBudget`]: total/reserved budget configuration
//! - [`VramLedger`]: outstanding-grant ledger, the single source of truth
//! - [`GpuResourceManager`]: async acquire/release with queueing and
//!   timeouts
//! - [`GpuMetrics`]: Prometheus instrumentation
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use portray_gpu::{GpuResourceManager, VramBudget};
//! use portray_types::GrantPriority;
//!
//! # async fn demo() -> Result<(), portray_gpu::GpuError> {
//! let manager = GpuResourceManager::new(VramBudget::new(12_288));
//!
//! let grant = manager
//!     .acquire("task-1", 4_000, GrantPriority::Normal, Duration::from_secs(30))
//!     .await?;
//! // ... run the GPU-bound call ...
//! manager.release(grant)?;
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod ledger;
pub mod manager;
pub mod metrics;

pub use budget::{presets, VramBudget, DEFAULT_RESERVED_MB, DEFAULT_TOTAL_VRAM_MB};
pub use ledger::{GrantRecord, VramLedger};
pub use manager::{GpuGrant, GpuResourceManager};
pub use metrics::{GpuMetrics, MetricsError};

use serde::Serialize;
use thiserror::Error;

use portray_types::GrantPriority;

/// Error type for GPU admission operations.
#[derive(Debug, Clone, Error)]
pub enum GpuError {
    /// Capacity did not free up within the caller's timeout.
    #[error("GPU admission of {requested_mb} MB timed out after {waited_ms} ms")]
    AdmissionTimeout { requested_mb: u64, waited_ms: u64 },

    /// The estimate cannot be satisfied by the budget at all.
    #[error(
        "GPU admission of {requested_mb} MB rejected (used: {used_mb} MB, allocatable: {allocatable_mb} MB)"
    )]
    AdmissionRejected {
        requested_mb: u64,
        used_mb: u64,
        allocatable_mb: u64,
    },

    /// Release of a request id that holds no grant.
    #[error("grant for request '{request_id}' is not held")]
    GrantNotHeld { request_id: String },

    /// Admission of a request id that already holds a grant.
    #[error("request '{request_id}' already holds a grant")]
    AlreadyHeld { request_id: String },

    /// Invariant breakage that should never happen in practice.
    #[error("internal GPU admission error: {0}")]
    Internal(String),
}

pub type GpuResult<T> = Result<T, GpuError>;

/// Point-in-time view of budget, usage and queue state.
#[derive(Debug, Clone, Serialize)]
pub struct GpuUtilization {
    /// Total VRAM budget in MB
    pub total_mb: u64,
    /// Reserved for driver/runtime overhead in MB
    pub reserved_mb: u64,
    /// Grantable VRAM in MB
    pub allocatable_mb: u64,
    /// Sum of admitted estimates in MB
    pub used_mb: u64,
    /// Remaining grantable VRAM in MB
    pub available_mb: u64,
    /// Usage as a percentage of the allocatable budget
    pub utilization_percent: f32,
    /// Outstanding grants
    pub active_grants: usize,
    /// Requests waiting for capacity
    pub queued_requests: usize,
    /// Per-grant detail, longest-held first
    pub grants: Vec<GrantSnapshot>,
    /// Per-waiter detail in queue order
    pub queued: Vec<QueuedSnapshot>,
}

/// One outstanding grant, as exposed by [`GpuResourceManager::utilization`].
#[derive(Debug, Clone, Serialize)]
pub struct GrantSnapshot {
    pub request_id: String,
    pub task_id: String,
    pub vram_mb: u64,
    pub priority: GrantPriority,
    pub held_ms: u64,
}

/// One queued request, as exposed by [`GpuResourceManager::utilization`].
#[derive(Debug, Clone, Serialize)]
pub struct QueuedSnapshot {
    pub request_id: String,
    pub task_id: String,
    pub vram_mb: u64,
    pub priority: GrantPriority,
    pub waited_ms: u64,
}
