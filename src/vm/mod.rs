//! Virtual Memory Subsystem
//!
//! Per-process demand paging:
//! - addr: virtual and physical address types
//! - pmap: Sv39 page table entries and the page table interface
//! - frame: physical frame pool
//! - swap: per-process swap slots and backing store
//! - ledger: accounting of tracked pages
//! - policy: NFUA, LAPA and SCFIFO page replacement
//! - space: the address space that ties them together
//! - fault: page fault entry
//! - uaccess: copies to and from user memory

pub mod addr;
pub mod fault;
pub mod frame;
pub mod ledger;
pub mod pmap;
pub mod policy;
pub mod space;
pub mod swap;
pub mod uaccess;

pub use addr::{round_page, trunc_page, PhysAddr, VirtAddr, MAXVA, PAGE_SIZE};
pub use fault::{handle_page_fault, FaultKind, FaultResult};
pub use frame::{frame_pool, init_frame_pool, FrameAllocator, FramePool};
pub use ledger::{Ledger, PageHandle, PageState, TrackedPage};
pub use pmap::{PageTable, Pte, PteFlags, SoftPageTable};
pub use policy::{PolicyKind, ReplacementPolicy, Victim};
pub use space::{AddressSpace, PagingSnapshot, PagingStats};
pub use swap::{MemSwapFile, SwapSlot, SwapSpace, SwapStore};
pub use uaccess::{copy_in, copy_in_str, copy_out};
