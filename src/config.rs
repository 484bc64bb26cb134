//! Paging configuration
//!
//! Per-process limits and the replacement policy. The defaults match the
//! classic xv6 assignment: 16 pages in RAM and 32 pages in total, so 16
//! swap slots. The default policy is chosen by cargo feature.

use crate::error::{VmError, VmResult};
use crate::vm::policy::PolicyKind;

/// Maximum pages of one process resident in physical memory
pub const MAX_PSYC_PAGES: usize = 16;

/// Maximum pages of one process, resident plus swapped
pub const MAX_TOTAL_PAGES: usize = 32;

/// Swap slots per process
pub const MAX_SWAP_PAGES: usize = MAX_TOTAL_PAGES - MAX_PSYC_PAGES;

/// Paging limits for an address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingConfig {
    /// Resident set ceiling
    pub max_resident: usize,
    /// Swap slots available
    pub max_swap: usize,
    /// Replacement policy
    pub policy: PolicyKind,
}

impl PagingConfig {
    pub const fn new(max_resident: usize, max_swap: usize, policy: PolicyKind) -> Self {
        Self {
            max_resident,
            max_swap,
            policy,
        }
    }

    pub const fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    pub const fn with_max_resident(mut self, pages: usize) -> Self {
        self.max_resident = pages;
        self
    }

    pub const fn with_max_swap(mut self, pages: usize) -> Self {
        self.max_swap = pages;
        self
    }

    /// Pages the tracking table can hold
    pub const fn capacity(&self) -> usize {
        self.max_resident + self.max_swap
    }

    /// Reject limits the engine cannot work with
    pub fn validate(&self) -> VmResult<()> {
        if self.policy.is_paging() && self.max_resident == 0 {
            return Err(VmError::InvalidConfig("max_resident must be at least 1"));
        }
        Ok(())
    }
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self::new(MAX_PSYC_PAGES, MAX_SWAP_PAGES, PolicyKind::compiled())
    }
}
