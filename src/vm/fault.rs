//! VM Fault - Page Fault Handling
//!
//! Entry point from the trap handler. A fault on a paged-out user page is
//! demand paging at work: the page is read back from swap and the faulting
//! instruction restarted. A fault on a page that is already present (stale
//! TLB entry, or another access raced ahead) is retried. Anything else is a
//! segmentation fault for the process.

use crate::error::{VmError, VmResult};
use crate::vm::addr::{VirtAddr, MAXVA};
use crate::vm::pmap::PteFlags;
use crate::vm::space::AddressSpace;

// ============================================================================
// Fault Types
// ============================================================================

/// Access that caused the fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Read
    Load,
    /// Write
    Store,
    /// Instruction fetch
    Instruction,
}

impl FaultKind {
    /// Decode a RISC-V `scause` page-fault code
    pub const fn from_scause(scause: u64) -> Option<Self> {
        match scause {
            12 => Some(FaultKind::Instruction),
            13 => Some(FaultKind::Load),
            15 => Some(FaultKind::Store),
            _ => None,
        }
    }

    /// PTE permission the access needs
    pub fn required(self) -> PteFlags {
        match self {
            FaultKind::Load => PteFlags::READ,
            FaultKind::Store => PteFlags::WRITE,
            FaultKind::Instruction => PteFlags::EXEC,
        }
    }
}

/// Outcome of a handled fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    /// Page brought in from swap
    PagedIn,
    /// Page was already present; restart the access
    Retry,
}

// ============================================================================
// Fault Handler
// ============================================================================

/// Resolve a user page fault at `va`.
///
/// Returns `BadAddress` when the address is unmapped, not a user page, or
/// lacks the permission the access needs; the caller kills the process.
pub fn handle_page_fault(
    space: &mut AddressSpace,
    va: VirtAddr,
    cause: FaultKind,
) -> VmResult<FaultResult> {
    space.note_fault();

    let page = va.page_round_down();
    if page.0 >= MAXVA {
        return Err(VmError::BadAddress(va));
    }

    let pte = match space.page_table().lookup(page) {
        Some(pte) => pte,
        None => return Err(segfault(va, cause)),
    };

    if pte.is_paged_out() {
        if !pte.contains(PteFlags::USER | cause.required()) {
            return Err(segfault(va, cause));
        }
        space.fault_in(page)?;
        return Ok(FaultResult::PagedIn);
    }

    if pte.is_valid() && pte.contains(PteFlags::USER | cause.required()) {
        log::trace!("spurious {:?} fault at {:#x}", cause, va.0);
        return Ok(FaultResult::Retry);
    }

    Err(segfault(va, cause))
}

fn segfault(va: VirtAddr, cause: FaultKind) -> VmError {
    log::debug!("segfault: {:?} at {:#x}", cause, va.0);
    VmError::BadAddress(va)
}
