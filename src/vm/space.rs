//! Address Space - Paging Orchestrator
//!
//! Ties the page table, the ledger, the swap space and the frame pool
//! together. Every mutation of a process's user memory goes through here:
//! growth and shrinking, page-in on fault, page-out under pressure, fork
//! copies and teardown.
//!
//! ## Invariants (after every public operation)
//!
//! 1. A valid leaf PTE <=> a `Resident` ledger entry at that address
//! 2. A paged-out leaf PTE <=> a `SwappedOut` ledger entry at that address,
//!    owning exactly one claimed swap slot
//! 3. No address is tracked twice
//! 4. Resident pages never exceed the configured ceiling
//!
//! Violations panic. Resource exhaustion and swap I/O failures come back as
//! `VmError` with the operation unwound.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::PagingConfig;
use crate::error::{VmError, VmResult};
use crate::vm::addr::{round_page, PhysAddr, VirtAddr, MAXVA, PAGE_SIZE};
use crate::vm::frame::FrameAllocator;
use crate::vm::ledger::{Ledger, PageHandle, PageState};
use crate::vm::pmap::{PageTable, Pte, PteFlags, SoftPageTable};
use crate::vm::policy::ReplacementPolicy;
use crate::vm::swap::{SwapSlot, SwapSpace};

// ============================================================================
// Paging Statistics
// ============================================================================

/// Per-address-space paging counters
#[derive(Debug, Default)]
pub struct PagingStats {
    /// Page faults taken
    pub faults: AtomicU64,
    /// Pages read back from swap
    pub page_ins: AtomicU64,
    /// Pages written to swap
    pub evictions: AtomicU64,
    /// Pages spared by second-chance FIFO
    pub second_chances: AtomicU64,
    /// Aging ticks delivered
    pub ticks: AtomicU64,
    /// Failed swap transfers
    pub swap_io_errors: AtomicU64,
}

impl PagingStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PagingSnapshot {
        PagingSnapshot {
            faults: self.faults.load(Ordering::Relaxed),
            page_ins: self.page_ins.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            second_chances: self.second_chances.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            swap_io_errors: self.swap_io_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `PagingStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PagingSnapshot {
    pub faults: u64,
    pub page_ins: u64,
    pub evictions: u64,
    pub second_chances: u64,
    pub ticks: u64,
    pub swap_io_errors: u64,
}

// ============================================================================
// Address Space
// ============================================================================

/// User address space of one process, with its paging state
pub struct AddressSpace {
    page_table: Box<dyn PageTable>,
    ledger: Ledger,
    swap: SwapSpace,
    frames: Arc<dyn FrameAllocator>,
    policy: &'static dyn ReplacementPolicy,
    config: PagingConfig,
    /// Tracked and swappable (user process and a paging policy)
    paging: bool,
    stats: PagingStats,
}

impl AddressSpace {
    /// Empty address space with a software page table and in-memory swap
    pub fn new(
        config: PagingConfig,
        eligible: bool,
        frames: Arc<dyn FrameAllocator>,
    ) -> VmResult<Self> {
        let swap = SwapSpace::in_memory(config.max_swap);
        Self::with_parts(config, eligible, frames, Box::new(SoftPageTable::new()), swap)
    }

    /// Address space over caller-supplied page table and swap space
    pub fn with_parts(
        config: PagingConfig,
        eligible: bool,
        frames: Arc<dyn FrameAllocator>,
        page_table: Box<dyn PageTable>,
        swap: SwapSpace,
    ) -> VmResult<Self> {
        config.validate()?;
        if swap.capacity() < config.max_swap {
            return Err(VmError::InvalidConfig("swap space smaller than max_swap"));
        }

        let paging = eligible && config.policy.is_paging();
        log::debug!(
            "address space: policy {} paging={} resident<={} swap<={}",
            config.policy,
            paging,
            config.max_resident,
            config.max_swap
        );

        Ok(Self {
            page_table,
            ledger: Ledger::new(config.max_resident, config.max_swap),
            swap,
            frames,
            policy: config.policy.policy(),
            config,
            paging,
            stats: PagingStats::new(),
        })
    }

    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    /// Is this space tracked by the pager?
    pub fn is_paging(&self) -> bool {
        self.paging
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn page_table(&self) -> &dyn PageTable {
        &*self.page_table
    }

    pub fn page_table_mut(&mut self) -> &mut dyn PageTable {
        &mut *self.page_table
    }

    pub fn frames(&self) -> &Arc<dyn FrameAllocator> {
        &self.frames
    }

    pub fn stats(&self) -> &PagingStats {
        &self.stats
    }

    pub fn resident_count(&self) -> usize {
        self.ledger.resident_count()
    }

    pub fn swapped_count(&self) -> usize {
        self.ledger.swapped_count()
    }

    /// Physical address of a valid user page
    pub fn walk_addr(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.page_table.translate(va)
    }

    // ========================================================================
    // Growth and shrinking
    // ========================================================================

    /// Grow the address space from `old` to `new` bytes.
    ///
    /// Each new page gets a zeroed frame mapped readable, user-accessible
    /// and `xperm`, and is admitted to the resident set. On failure the
    /// space is rolled back to `old` and the error returned.
    pub fn grow(&mut self, old: u64, new: u64, xperm: PteFlags) -> VmResult<u64> {
        if new < old {
            return Ok(old);
        }

        let mut a = round_page(old);
        while a < new {
            let va = VirtAddr(a);
            let frame = match self.frames.alloc_frame() {
                Some(frame) => frame,
                None => {
                    self.shrink(a, old);
                    return Err(VmError::OutOfMemory);
                }
            };
            self.frames.zero_frame(frame);

            let flags = PteFlags::READ | PteFlags::USER | xperm;
            if let Err(err) = self.page_table.map(va, frame, PAGE_SIZE, flags) {
                self.frames.free_frame(frame);
                self.shrink(a, old);
                return Err(err);
            }

            if let Err(err) = self.admit(va) {
                self.discard_untracked(va, frame);
                self.shrink(a, old);
                return Err(err);
            }

            a += PAGE_SIZE as u64;
        }

        Ok(new)
    }

    /// Shrink the address space from `old` to `new` bytes, returning `new`
    /// (or `old` when there is nothing to do).
    pub fn shrink(&mut self, old: u64, new: u64) -> u64 {
        if new >= old {
            return old;
        }

        if round_page(new) < round_page(old) {
            let npages = (round_page(old) - round_page(new)) / PAGE_SIZE as u64;
            self.unmap(VirtAddr(round_page(new)), npages, true);
        }

        new
    }

    /// Map the first user page at address 0 and fill it with `code`
    pub fn first_page(&mut self, code: &[u8]) -> VmResult<()> {
        if code.len() >= PAGE_SIZE {
            panic!("uvmfirst: more than a page");
        }

        let frame = self.frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
        self.frames.zero_frame(frame);
        self.frames.write_frame(frame, code);

        let flags = PteFlags::READ | PteFlags::WRITE | PteFlags::EXEC | PteFlags::USER;
        if let Err(err) = self.page_table.map(VirtAddr(0), frame, PAGE_SIZE, flags) {
            self.frames.free_frame(frame);
            return Err(err);
        }
        if let Err(err) = self.admit(VirtAddr(0)) {
            self.discard_untracked(VirtAddr(0), frame);
            return Err(err);
        }
        Ok(())
    }

    /// Remove user access from one page (stack guard)
    pub fn clear_user(&mut self, va: VirtAddr) {
        match self.page_table.walk(va, false) {
            Some(pte) => pte.remove(PteFlags::USER),
            None => panic!("uvmclear: {:#x}", va.0),
        }
    }

    /// Undo a mapping that never made it into the ledger
    fn discard_untracked(&mut self, va: VirtAddr, frame: PhysAddr) {
        if let Some(pte) = self.page_table.walk(va, false) {
            pte.clear();
        }
        self.page_table.flush(va);
        self.frames.free_frame(frame);
    }

    // ========================================================================
    // Admission and eviction
    // ========================================================================

    /// Start tracking a freshly mapped page, evicting first if the
    /// resident set is full.
    pub fn admit(&mut self, va: VirtAddr) -> VmResult<()> {
        if !self.paging {
            return Ok(());
        }

        match self.page_table.lookup(va) {
            Some(pte) if pte.is_valid() => {}
            _ => panic!("admit: {:#x} is not mapped", va.0),
        }

        if self.ledger.is_full() {
            return Err(VmError::TooManyPages {
                limit: self.ledger.capacity(),
            });
        }
        if self.ledger.resident_full() {
            self.evict()?;
        }

        let handle = match self.ledger.reserve_slot() {
            Some(handle) => handle,
            None => panic!("admit: no free ledger entry for {:#x}", va.0),
        };
        self.ledger.mark_resident(handle, va);
        self.policy.on_load(&mut self.ledger, handle);

        if let Some(pte) = self.page_table.walk(va, false) {
            pte.remove(PteFlags::PAGED_OUT);
            pte.insert(PteFlags::VALID);
        }
        Ok(())
    }

    /// Move the policy's victim out to a fresh swap slot
    pub fn evict(&mut self) -> VmResult<PageHandle> {
        self.evict_into(None)
    }

    /// Evict into `spare` if given (a slot the caller owns and is about
    /// to give up), otherwise into a newly claimed slot.
    fn evict_into(&mut self, spare: Option<SwapSlot>) -> VmResult<PageHandle> {
        let (slot, claimed) = match spare {
            Some(slot) => (slot, false),
            None => match self.swap.claim() {
                Some(slot) => (slot, true),
                None => panic!("evict: swap file is full"),
            },
        };

        let victim = self
            .policy
            .select_victim(&mut self.ledger, &mut *self.page_table);
        PagingStats::bump(&self.stats.second_chances, victim.second_chances as u64);

        let va = self.ledger.get(victim.handle).va();
        let pte = match self.page_table.lookup(va) {
            Some(pte) if pte.is_valid() && !pte.is_paged_out() => pte,
            other => panic!("evict: victim {:#x} has pte {:?}", va.0, other),
        };

        let mut page = [0u8; PAGE_SIZE];
        self.frames.read_frame(pte.pa(), &mut page);
        if let Err(err) = self.swap.store(slot, &page) {
            if claimed {
                self.swap.release(slot);
            }
            PagingStats::bump(&self.stats.swap_io_errors, 1);
            log::warn!("evict: writing {:#x} to slot {} failed: {}", va.0, slot.0, err);
            return Err(err.into());
        }

        if let Some(entry) = self.page_table.walk(va, false) {
            let flags = (entry.flags() - PteFlags::VALID) | PteFlags::PAGED_OUT;
            *entry = Pte::new(PhysAddr(0), flags);
        }
        self.frames.free_frame(pte.pa());
        self.page_table.flush(va);
        self.ledger.mark_swapped(victim.handle, va, slot);

        PagingStats::bump(&self.stats.evictions, 1);
        log::debug!("evict: {:#x} -> swap slot {}", va.0, slot.0);
        Ok(victim.handle)
    }

    /// Bring a paged-out page back into RAM.
    ///
    /// Already-resident addresses succeed without doing anything. Anything
    /// that is neither resident nor paged out is `BadAddress`.
    pub fn fault_in(&mut self, va: VirtAddr) -> VmResult<()> {
        let va = va.page_round_down();
        if va.0 >= MAXVA {
            return Err(VmError::BadAddress(va));
        }

        let pte = match self.page_table.lookup(va) {
            Some(pte) => pte,
            None => return Err(VmError::BadAddress(va)),
        };
        if pte.is_valid() && pte.is_paged_out() {
            panic!("fault_in: {:#x} both present and paged out", va.0);
        }
        if pte.is_valid() {
            return Ok(());
        }
        if !pte.is_paged_out() {
            return Err(VmError::BadAddress(va));
        }

        let handle = match self.ledger.find_by_address(va) {
            Some(handle) if self.ledger.get(handle).is_swapped() => handle,
            _ => panic!("fault_in: {:#x} paged out but not in swap", va.0),
        };
        let slot = match self.ledger.get(handle).slot() {
            Some(slot) => slot,
            None => panic!("fault_in: {:#x} has no swap slot", va.0),
        };

        let frame = self.frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
        let mut page = [0u8; PAGE_SIZE];
        if let Err(err) = self.swap.load(slot, &mut page) {
            self.frames.free_frame(frame);
            PagingStats::bump(&self.stats.swap_io_errors, 1);
            log::warn!("fault_in: reading {:#x} from slot {} failed: {}", va.0, slot.0, err);
            return Err(err.into());
        }
        self.frames.write_frame(frame, &page);

        if self.ledger.resident_full() {
            // With every slot taken the victim goes where this page was
            let spare = if self.swap.free_slots() == 0 {
                Some(slot)
            } else {
                None
            };
            if let Err(err) = self.evict_into(spare) {
                self.frames.free_frame(frame);
                return Err(err);
            }
            if spare.is_none() {
                self.swap.release(slot);
            }
        } else {
            self.swap.release(slot);
        }

        if let Some(entry) = self.page_table.walk(va, false) {
            let flags = (entry.flags() - PteFlags::PAGED_OUT) | PteFlags::VALID;
            *entry = Pte::new(frame, flags);
        }
        self.ledger.mark_resident(handle, va);
        self.policy.on_load(&mut self.ledger, handle);

        PagingStats::bump(&self.stats.page_ins, 1);
        log::debug!("fault_in: {:#x} <- swap slot {}", va.0, slot.0);
        Ok(())
    }

    /// Count a fault taken on this space
    pub(crate) fn note_fault(&self) {
        PagingStats::bump(&self.stats.faults, 1);
    }

    /// Scheduler tick: let the policy age the resident set
    pub fn tick(&mut self) -> usize {
        if !self.paging {
            return 0;
        }
        PagingStats::bump(&self.stats.ticks, 1);
        self.policy.on_tick(&mut self.ledger, &mut *self.page_table)
    }

    // ========================================================================
    // Unmapping and teardown
    // ========================================================================

    /// Remove `npages` mappings starting at `va`, releasing frames (when
    /// `free` is set) and swap slots, and forgetting the tracked pages.
    ///
    /// Every page in the range must be mapped or paged out.
    pub fn unmap(&mut self, va: VirtAddr, npages: u64, free: bool) {
        if !va.is_page_aligned() {
            panic!("uvmunmap: not aligned");
        }

        for i in 0..npages {
            let a = va.add_pages(i);
            let pte = match self.page_table.lookup(a) {
                Some(pte) => pte,
                None => panic!("uvmunmap: walk {:#x}", a.0),
            };
            if !pte.is_valid() && !pte.is_paged_out() {
                panic!("uvmunmap: not mapped {:#x}", a.0);
            }
            if pte.is_valid() && pte.is_paged_out() {
                panic!("uvmunmap: {:#x} both present and paged out", a.0);
            }
            if pte.is_valid() && !pte.is_leaf() {
                panic!("uvmunmap: not a leaf {:#x}", a.0);
            }

            if self.paging {
                self.untrack(a, pte);
            } else if pte.is_paged_out() {
                panic!("uvmunmap: paged-out {:#x} in a non-paging space", a.0);
            }

            if free && pte.is_valid() {
                self.frames.free_frame(pte.pa());
            }
            if let Some(entry) = self.page_table.walk(a, false) {
                entry.clear();
            }
            if pte.is_valid() {
                self.page_table.flush(a);
            }
        }
    }

    /// Drop the ledger entry (and swap slot) behind a leaf being unmapped
    fn untrack(&mut self, va: VirtAddr, pte: Pte) {
        let handle = match self.ledger.find_by_address(va) {
            Some(handle) => handle,
            None => panic!("uvmunmap: {:#x} mapped but not tracked", va.0),
        };

        let state = self.ledger.get(handle).state();
        match (state, pte.is_valid()) {
            (PageState::Resident, true) | (PageState::SwappedOut, false) => {}
            (state, _) => panic!(
                "uvmunmap: {:#x} tracked {:?} but pte {:?}",
                va.0, state, pte
            ),
        }

        let page = self.ledger.release(handle);
        if let Some(slot) = page.slot() {
            self.swap.release(slot);
        }
    }

    /// Unmap all user memory below `size` and free the page table
    pub fn free(&mut self, size: u64) {
        if size > 0 {
            self.unmap(VirtAddr(0), round_page(size) / PAGE_SIZE as u64, true);
        }
        self.page_table.destroy();
        if self.ledger.tracked_count() != 0 {
            panic!("uvmfree: {} pages still tracked", self.ledger.tracked_count());
        }
    }

    // ========================================================================
    // Fork
    // ========================================================================

    /// Copy the first `size` bytes of this space into `child`.
    ///
    /// Resident pages get a new frame with the same contents. Paged-out
    /// pages get their own slot in the child's swap space holding a copy of
    /// the parent's slot, so parent and child never share swap. On failure
    /// everything copied into the child so far is unmapped.
    pub fn fork_copy(&mut self, child: &mut AddressSpace, size: u64) -> VmResult<()> {
        if self.paging
            && child.paging
            && (self.config.max_resident != child.config.max_resident
                || self.config.max_swap != child.config.max_swap)
        {
            panic!("uvmcopy: parent and child paging limits differ");
        }

        let mut i = 0;
        while i < size {
            if let Err(err) = self.copy_page(child, VirtAddr(i)) {
                child.unmap(VirtAddr(0), i / PAGE_SIZE as u64, true);
                return Err(err);
            }
            i += PAGE_SIZE as u64;
        }

        if self.paging && child.paging {
            child.ledger.set_generation(self.ledger.generation());
        }
        Ok(())
    }

    fn copy_page(&mut self, child: &mut AddressSpace, va: VirtAddr) -> VmResult<()> {
        let pte = match self.page_table.lookup(va) {
            Some(pte) => pte,
            None => panic!("uvmcopy: pte should exist {:#x}", va.0),
        };
        if !pte.is_valid() && !pte.is_paged_out() {
            panic!("uvmcopy: page not present {:#x}", va.0);
        }
        if pte.is_valid() && pte.is_paged_out() {
            panic!("uvmcopy: {:#x} both present and paged out", va.0);
        }

        let tracked = if self.paging {
            match self.ledger.find_by_address(va) {
                Some(handle) => Some((handle, self.ledger.get(handle).clone())),
                None => panic!("uvmcopy: {:#x} not tracked", va.0),
            }
        } else {
            None
        };

        // Same layout on both sides: the child takes over the entry as is
        if let (Some((handle, page)), true) = (&tracked, child.paging) {
            if pte.is_paged_out() {
                let slot = match page.slot() {
                    Some(slot) => slot,
                    None => panic!("uvmcopy: {:#x} swapped without a slot", va.0),
                };
                let mut bytes = [0u8; PAGE_SIZE];
                self.swap.load(slot, &mut bytes)?;

                child.swap.claim_at(slot);
                if let Err(err) = child.swap.store(slot, &bytes) {
                    child.swap.release(slot);
                    return Err(err.into());
                }
                match child.page_table.walk(va, true) {
                    Some(entry) => *entry = Pte::new(PhysAddr(0), pte.flags()),
                    None => {
                        child.swap.release(slot);
                        return Err(VmError::OutOfMemory);
                    }
                }
            } else {
                let frame = child.frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
                self.copy_frame_to(pte.pa(), child, frame);
                if let Err(err) = child.page_table.map(va, frame, PAGE_SIZE, pte.flags()) {
                    child.frames.free_frame(frame);
                    return Err(err);
                }
            }
            child.ledger.adopt(*handle, page);
            return Ok(());
        }

        // Otherwise the child gets a resident copy and admits it itself
        let frame = child.frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
        if pte.is_paged_out() {
            let slot = match tracked.as_ref().and_then(|(_, page)| page.slot()) {
                Some(slot) => slot,
                None => panic!("uvmcopy: {:#x} swapped without a slot", va.0),
            };
            let mut bytes = [0u8; PAGE_SIZE];
            if let Err(err) = self.swap.load(slot, &mut bytes) {
                child.frames.free_frame(frame);
                return Err(err.into());
            }
            child.frames.write_frame(frame, &bytes);
        } else {
            self.copy_frame_to(pte.pa(), child, frame);
        }

        let flags = (pte.flags() - PteFlags::PAGED_OUT) | PteFlags::VALID;
        if let Err(err) = child.page_table.map(va, frame, PAGE_SIZE, flags) {
            child.frames.free_frame(frame);
            return Err(err);
        }
        if let Err(err) = child.admit(va) {
            child.discard_untracked(va, frame);
            return Err(err);
        }
        Ok(())
    }

    fn copy_frame_to(&self, src: PhysAddr, child: &AddressSpace, dst: PhysAddr) {
        if Arc::ptr_eq(&self.frames, &child.frames) {
            self.frames.copy_frame(src, dst);
            return;
        }
        let mut bytes = [0u8; PAGE_SIZE];
        self.frames.read_frame(src, &mut bytes);
        child.frames.write_frame(dst, &bytes);
    }

    // ========================================================================
    // Consistency
    // ========================================================================

    /// Panic unless page table, ledger and swap slots agree
    pub fn check_invariants(&self) {
        let mut leaves = Vec::new();
        self.page_table
            .for_each_leaf(&mut |va, pte| leaves.push((va, pte)));

        let mut present = 0;
        let mut paged_out = 0;
        let mut slots = Vec::new();

        for (va, pte) in leaves {
            assert!(
                !(pte.is_valid() && pte.is_paged_out()),
                "{:#x} both present and paged out",
                va.0
            );

            if !self.paging {
                assert!(!pte.is_paged_out(), "{:#x} paged out without paging", va.0);
                continue;
            }

            let handle = match self.ledger.find_by_address(va) {
                Some(handle) => handle,
                None => panic!("leaf {:#x} is not tracked", va.0),
            };
            let page = self.ledger.get(handle);
            assert_eq!(page.va(), va, "index points at the wrong entry");

            if pte.is_valid() {
                assert!(page.is_resident(), "valid {:#x} tracked as {:?}", va.0, page.state());
                present += 1;
            } else {
                assert!(page.is_swapped(), "paged-out {:#x} tracked as {:?}", va.0, page.state());
                let slot = match page.slot() {
                    Some(slot) => slot,
                    None => panic!("swapped {:#x} has no slot", va.0),
                };
                assert!(self.swap.is_claimed(slot), "slot {} of {:#x} not claimed", slot.0, va.0);
                slots.push(slot);
                paged_out += 1;
            }
        }

        if !self.paging {
            return;
        }

        assert_eq!(present, self.ledger.resident_count(), "resident count drifted");
        assert_eq!(paged_out, self.ledger.swapped_count(), "swapped count drifted");
        assert!(self.ledger.resident_count() <= self.ledger.max_resident());
        assert!(self.ledger.tracked_count() <= self.ledger.capacity());
        assert_eq!(self.swap.in_use(), paged_out, "swap slots leaked");

        slots.sort();
        let owned = slots.len();
        slots.dedup();
        assert_eq!(slots.len(), owned, "swap slot shared by two pages");
    }
}

// ============================================================================
// Tests
// ============================================================================
