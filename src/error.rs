//! Recoverable paging errors
//!
//! Invariant violations are not represented here: they panic at the point
//! of detection. Everything in this module is resource exhaustion or I/O
//! that the caller is expected to unwind from.

use thiserror::Error;

use crate::vm::addr::VirtAddr;

/// Swap store transfer failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("swap transfer of {len} bytes at offset {offset:#x} failed")]
pub struct SwapIoError {
    pub offset: usize,
    pub len: usize,
}

/// Errors reported by paging operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// No free physical frame (or page-table page)
    #[error("out of physical memory")]
    OutOfMemory,

    /// Resident plus swapped pages already fill the tracking table
    #[error("process page limit reached ({limit} pages)")]
    TooManyPages { limit: usize },

    /// Swap read or write failed
    #[error("swap i/o: {0}")]
    SwapIo(#[from] SwapIoError),

    /// Address is neither mapped nor paged out
    #[error("bad address {0:?}")]
    BadAddress(VirtAddr),

    /// String copy ran past its limit without a terminator
    #[error("string not terminated within {max} bytes")]
    Unterminated { max: usize },

    /// Paging configuration rejected
    #[error("invalid paging configuration: {0}")]
    InvalidConfig(&'static str),
}

impl VmError {
    /// Value handed back across the syscall boundary
    pub const fn errno(&self) -> i64 {
        -1
    }
}

/// Result alias for paging operations
pub type VmResult<T> = Result<T, VmError>;
