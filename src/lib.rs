//! swapvm - Per-process demand paging for an xv6-style kernel
//!
//! Each user process keeps at most a fixed number of pages in physical
//! memory; the rest live in a per-process swap file. A pluggable
//! replacement policy (NFUA, LAPA or second-chance FIFO) picks the page to
//! evict when the resident set is full, and page faults bring swapped pages
//! back.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Kernel-appropriate clippy configuration
// Hardware register code often uses explicit bit shifts for documentation
#![allow(clippy::identity_op)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod types;

pub mod config;
pub mod console;
pub mod error;
pub mod proc;
pub mod vm;

pub use config::{PagingConfig, MAX_PSYC_PAGES, MAX_SWAP_PAGES, MAX_TOTAL_PAGES};
pub use error::{SwapIoError, VmError, VmResult};
pub use proc::{admit_range, fault_in, fork_copy, release_range, Process};
pub use types::Pid;
pub use vm::{AddressSpace, FaultKind, FaultResult, PolicyKind};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Library name
pub const NAME: &str = "swapvm";

/// Bring up logging and the system frame pool
pub fn init(frames: usize, level: log::LevelFilter) -> alloc::sync::Arc<vm::FramePool> {
    console::init(level);
    let pool = vm::init_frame_pool(frames);
    log::info!(
        "{} {}: default policy {}, {} resident / {} total pages per process",
        NAME,
        VERSION,
        PolicyKind::compiled(),
        MAX_PSYC_PAGES,
        MAX_TOTAL_PAGES
    );
    pool
}
