//! VRAM budget configuration for admission control.
//!
//! The budget defines how much VRAM the admission manager may hand out.
//! A reserved slice is kept back for driver/runtime overhead; admission
//! is always strict — the sum of outstanding grants never exceeds the
//! allocatable amount.

use std::fmt;

/// Default total VRAM budget in MB (12 GB card).
pub const DEFAULT_TOTAL_VRAM_MB: u64 = 12_288;

/// Default reserved VRAM for driver/runtime overhead in MB.
pub const DEFAULT_RESERVED_MB: u64 = 1_024;

/// VRAM budget configuration.
///
/// Amounts are in megabytes; integer units keep the admission ledger
/// exact under repeated acquire/release cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VramBudget {
    /// Total budget (may be less than physical for safety margin).
    total_mb: u64,
    /// Reserved for driver/runtime overhead.
    reserved_mb: u64,
}

impl VramBudget {
    /// Create a budget with the default reserved slice.
    pub fn new(total_mb: u64) -> Self {
        Self::with_reserved(total_mb, DEFAULT_RESERVED_MB)
    }

    /// Create a budget with a custom reserved slice.
    pub fn with_reserved(total_mb: u64, reserved_mb: u64) -> Self {
        Self {
            total_mb,
            reserved_mb,
        }
    }

    /// Total VRAM budget in MB.
    pub fn total(&self) -> u64 {
        self.total_mb
    }

    /// Reserved VRAM in MB.
    pub fn reserved(&self) -> u64 {
        self.reserved_mb
    }

    /// Allocatable VRAM (total minus reserved) in MB.
    pub fn allocatable(&self) -> u64 {
        self.total_mb.saturating_sub(self.reserved_mb)
    }

    /// Whether an allocation of `size_mb` fits given current usage.
    pub fn can_fit(&self, size_mb: u64, current_used: u64) -> bool {
        self.remaining(current_used) >= size_mb
    }

    /// Remaining allocatable VRAM given current usage.
    pub fn remaining(&self, current_used: u64) -> u64 {
        self.allocatable().saturating_sub(current_used)
    }

    /// Utilization percentage of the allocatable budget (0-100).
    pub fn utilization_percent(&self, current_used: u64) -> f32 {
        let allocatable = self.allocatable();
        if allocatable > 0 {
            (current_used as f32 / allocatable as f32) * 100.0
        } else {
            0.0
        }
    }
}

impl Default for VramBudget {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_VRAM_MB)
    }
}

impl fmt::Display for VramBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} MB total, {} MB reserved, {} MB allocatable",
            self.total_mb,
            self.reserved_mb,
            self.allocatable()
        )
    }
}

/// Predefined budgets for common GPU types.
pub mod presets {
    use super::*;

    /// RTX 3060 12GB (reference hardware).
    pub fn rtx_3060() -> VramBudget {
        VramBudget::with_reserved(12_288, 1_024)
    }

    /// RTX 4080 16GB.
    pub fn rtx_4080() -> VramBudget {
        VramBudget::with_reserved(16_384, 1_024)
    }

    /// RTX 4090 24GB.
    pub fn rtx_4090() -> VramBudget {
        VramBudget::with_reserved(24_576, 1_536)
    }

    /// Budget from detected GPU total memory.
    ///
    /// Reserves 10% of total or 1 GB, whichever is larger.
    pub fn from_total(total_mb: u64) -> VramBudget {
        let reserved = (total_mb / 10).max(1_024);
        VramBudget::with_reserved(total_mb, reserved)
    }
}
