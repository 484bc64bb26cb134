//! Process Memory
//!
//! The part of a process control block the pager cares about: its pid, its
//! size and its address space behind the process lock. The free functions
//! are what process lifecycle code (sbrk, fork, exec, exit, the trap
//! handler) calls; each holds the process lock for its whole duration.
//!
//! Init and the shell (pid <= 2) are never paged.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::config::PagingConfig;
use crate::error::{VmError, VmResult};
use crate::types::Pid;
use crate::vm::addr::{round_page, VirtAddr, MAXVA, PAGE_SIZE};
use crate::vm::fault::{self, FaultKind, FaultResult};
use crate::vm::frame::FrameAllocator;
use crate::vm::pmap::PteFlags;
use crate::vm::space::{AddressSpace, PagingSnapshot};

// ============================================================================
// Process
// ============================================================================

/// A process as seen by the paging engine
pub struct Process {
    pid: Pid,
    /// Bytes of user memory, changed only with `space` locked
    sz: AtomicU64,
    space: Mutex<AddressSpace>,
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("sz", &self.sz)
            .finish_non_exhaustive()
    }
}

impl Process {
    /// Process with an empty address space
    pub fn new(pid: Pid, config: PagingConfig, frames: Arc<dyn FrameAllocator>) -> VmResult<Self> {
        let space = AddressSpace::new(config, !pid.is_os(), frames)?;
        Ok(Self::from_space(pid, space))
    }

    /// Process around an existing, empty address space
    pub fn from_space(pid: Pid, space: AddressSpace) -> Self {
        log::debug!("pid {}: paging {}", pid, space.is_paging());
        Self {
            pid,
            sz: AtomicU64::new(0),
            space: Mutex::new(space),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Size of user memory in bytes (`sys_memsize`)
    pub fn memsize(&self) -> u64 {
        self.sz.load(Ordering::Acquire)
    }

    pub fn is_paging(&self) -> bool {
        self.space.lock().is_paging()
    }

    pub fn stats(&self) -> PagingSnapshot {
        self.space.lock().stats().snapshot()
    }

    /// Run `f` with the process lock held
    pub fn with_space<R>(&self, f: impl FnOnce(&mut AddressSpace) -> R) -> R {
        f(&mut *self.space.lock())
    }

    /// Grow (positive) or shrink (negative) user memory by `n` bytes and
    /// return the old size. On failure the size is unchanged.
    pub fn grow_by(&self, n: i64) -> VmResult<u64> {
        let mut space = self.space.lock();
        let old = self.sz.load(Ordering::Acquire);

        let new = if n > 0 {
            let target = old
                .checked_add(n as u64)
                .filter(|&target| target < MAXVA)
                .ok_or(VmError::OutOfMemory)?;
            space.grow(old, target, PteFlags::WRITE)?
        } else if n < 0 {
            space.shrink(old, old.saturating_sub(n.unsigned_abs()))
        } else {
            old
        };

        self.sz.store(new, Ordering::Release);
        Ok(old)
    }

    /// Load the first user program into page 0 (init only)
    pub fn first_page(&self, code: &[u8]) -> VmResult<()> {
        let mut space = self.space.lock();
        space.first_page(code)?;
        self.sz.store(PAGE_SIZE as u64, Ordering::Release);
        Ok(())
    }

    /// Scheduler tick: age the resident set
    pub fn tick(&self) -> usize {
        self.space.lock().tick()
    }

    /// Trap handler entry for a user page fault
    pub fn page_fault(&self, va: VirtAddr, cause: FaultKind) -> VmResult<FaultResult> {
        fault::handle_page_fault(&mut *self.space.lock(), va, cause)
    }

    /// New process `pid` with a copy of this one's memory
    pub fn fork(&self, pid: Pid) -> VmResult<Process> {
        let mut parent = self.space.lock();
        let child = Process::new(pid, *parent.config(), parent.frames().clone())?;

        // The child is not visible to anyone yet, so taking its lock while
        // holding ours cannot deadlock
        let size = self.sz.load(Ordering::Acquire);
        copy_locked(self, &mut parent, &child, &mut child.space.lock(), size)?;
        Ok(child)
    }

    /// Release all user memory and the page table
    pub fn exit(&self) {
        let mut space = self.space.lock();
        let size = self.sz.swap(0, Ordering::AcqRel);
        space.free(size);
        log::debug!("pid {}: exited, {} bytes released", self.pid, size);
    }
}

// ============================================================================
// Lifecycle Entry Points
// ============================================================================

/// Map and admit fresh zeroed pages covering `[low, high)`.
///
/// The range must start at the current end of user memory, which then
/// moves to `high`. Returns the new size.
pub fn admit_range(p: &Process, low: u64, high: u64) -> VmResult<u64> {
    let mut space = p.space.lock();
    let sz = p.sz.load(Ordering::Acquire);
    if round_page(low) != round_page(sz) {
        return Err(VmError::BadAddress(VirtAddr(low)));
    }

    let new = space.grow(sz, high, PteFlags::WRITE)?;
    p.sz.store(new, Ordering::Release);
    Ok(new)
}

/// Unmap `[low, high)`, releasing frames and swap slots.
///
/// The range must end at the current end of user memory, which then moves
/// down to `low`. Returns the new size.
pub fn release_range(p: &Process, low: u64, high: u64) -> VmResult<u64> {
    let mut space = p.space.lock();
    let sz = p.sz.load(Ordering::Acquire);
    if round_page(high) != round_page(sz) {
        return Err(VmError::BadAddress(VirtAddr(high)));
    }

    let new = space.shrink(sz, low);
    p.sz.store(new, Ordering::Release);
    Ok(new)
}

/// Bring `va` back from swap
pub fn fault_in(p: &Process, va: VirtAddr) -> VmResult<()> {
    p.space.lock().fault_in(va)
}

/// Copy the first `size` bytes of `src` into the empty process `dst`,
/// which takes that size
pub fn fork_copy(src: &Process, dst: &Process, size: u64) -> VmResult<()> {
    if src.pid == dst.pid {
        panic!("fork_copy: pid {} into itself", src.pid);
    }

    // Lock in pid order
    let (mut parent, mut child) = if src.pid < dst.pid {
        let parent = src.space.lock();
        (parent, dst.space.lock())
    } else {
        let child = dst.space.lock();
        (src.space.lock(), child)
    };
    copy_locked(src, &mut parent, dst, &mut child, size)
}

/// Fork copy with both process locks held
fn copy_locked(
    src: &Process,
    parent: &mut AddressSpace,
    dst: &Process,
    child: &mut AddressSpace,
    size: u64,
) -> VmResult<()> {
    if round_page(size) > round_page(src.sz.load(Ordering::Acquire)) {
        return Err(VmError::BadAddress(VirtAddr(size)));
    }
    if dst.sz.load(Ordering::Acquire) != 0 {
        panic!("fork_copy: pid {} already has memory", dst.pid);
    }

    parent.fork_copy(child, size)?;
    dst.sz.store(size, Ordering::Release);
    Ok(())
}
