//! Grant ledger for VRAM admission control.
//!
//! The ledger is the single source of truth for outstanding grants. It
//! records every admitted request and enforces that the sum of admitted
//! estimates never exceeds the allocatable budget.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, warn};

use portray_types::GrantPriority;

use crate::budget::VramBudget;
use crate::GpuError;

/// One admitted request held in the ledger.
#[derive(Debug, Clone)]
pub struct GrantRecord {
    /// Unique admission request id
    pub request_id: String,
    /// Owning pipeline task
    pub task_id: String,
    /// Admitted VRAM estimate in MB
    pub vram_mb: u64,
    /// Priority the request was admitted with
    pub priority: GrantPriority,
    /// When the grant was issued
    pub acquired_at: Instant,
}

/// Tracks outstanding VRAM grants against a budget.
#[derive(Debug, Clone)]
pub struct VramLedger {
    budget: VramBudget,
    grants: HashMap<String, GrantRecord>,
    used_mb: u64,
}

impl VramLedger {
    pub fn new(budget: VramBudget) -> Self {
        Self {
            budget,
            grants: HashMap::new(),
            used_mb: 0,
        }
    }

    /// The configured budget.
    pub fn budget(&self) -> &VramBudget {
        &self.budget
    }

    /// Sum of admitted estimates in MB.
    pub fn used(&self) -> u64 {
        self.used_mb
    }

    /// Remaining allocatable VRAM in MB.
    pub fn available(&self) -> u64 {
        self.budget.remaining(self.used_mb)
    }

    /// Number of outstanding grants.
    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }

    /// Whether a request of the given size can be admitted right now.
    pub fn can_admit(&self, vram_mb: u64) -> bool {
        self.budget.can_fit(vram_mb, self.used_mb)
    }

    /// Admit a request into the ledger.
    ///
    /// The caller must have verified the request fits; this only defends
    /// the ledger's own invariants.
    ///
    /// # Errors
    /// - [`GpuError::AlreadyHeld`] if the request id is already admitted
    /// - [`GpuError::AdmissionRejected`] if the estimate no longer fits
    pub fn admit(&mut self, record: GrantRecord) -> Result<(), GpuError> {
        if self.grants.contains_key(&record.request_id) {
            warn!(request_id = %record.request_id, "request already holds a grant");
            return Err(GpuError::AlreadyHeld {
                request_id: record.request_id,
            });
        }
        if !self.can_admit(record.vram_mb) {
            return Err(GpuError::AdmissionRejected {
                requested_mb: record.vram_mb,
                used_mb: self.used_mb,
                allocatable_mb: self.budget.allocatable(),
            });
        }

        self.used_mb += record.vram_mb;
        debug!(
            request_id = %record.request_id,
            task_id = %record.task_id,
            vram_mb = record.vram_mb,
            used_mb = self.used_mb,
            available_mb = self.available(),
            "VRAM grant admitted"
        );
        self.grants.insert(record.request_id.clone(), record);

        Ok(())
    }

    /// Release a grant and return its record.
    ///
    /// Releasing a request that holds no grant is an error, not a no-op;
    /// callers surface it so double releases stay auditable.
    pub fn release(&mut self, request_id: &str) -> Result<GrantRecord, GpuError> {
        match self.grants.remove(request_id) {
            Some(record) => {
                self.used_mb = self.used_mb.saturating_sub(record.vram_mb);
                debug!(
                    request_id = %request_id,
                    freed_mb = record.vram_mb,
                    used_mb = self.used_mb,
                    available_mb = self.available(),
                    "VRAM grant released"
                );
                Ok(record)
            }
            None => {
                warn!(request_id = %request_id, "release of a grant that is not held");
                Err(GpuError::GrantNotHeld {
                    request_id: request_id.to_string(),
                })
            }
        }
    }

    /// Look up an outstanding grant.
    pub fn get(&self, request_id: &str) -> Option<&GrantRecord> {
        self.grants.get(request_id)
    }

    /// Snapshot of all outstanding grants.
    pub fn records(&self) -> impl Iterator<Item = &GrantRecord> {
        self.grants.values()
    }

    /// Utilization percentage of the allocatable budget (0-100).
    pub fn utilization_percent(&self) -> f32 {
        self.budget.utilization_percent(self.used_mb)
    }
}
