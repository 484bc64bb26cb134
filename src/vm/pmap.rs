//! Physical Map (pmap) - Page Table Adapter
//!
//! The pmap module is the narrow interface the paging engine uses to reach
//! hardware page tables. It translates, allocates table levels on demand
//! and maps leaves; everything else (unmapping with ledger bookkeeping,
//! retargeting on swap) is done by the address space on top of `walk`.
//!
//! ## Key Operations
//!
//! - `walk`: find (and optionally create) the leaf entry for an address
//! - `map`: install leaf mappings over a page-aligned range
//! - `flush`: drop the translation cached for one address
//!
//! ## Contracts
//!
//! Mapping over a valid entry, walking past `MAXVA` and destroying a table
//! that still has leaves are caller bugs and panic.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use bitflags::bitflags;
use core::fmt;

use crate::error::{VmError, VmResult};
use crate::vm::addr::{trunc_page, PhysAddr, VirtAddr, MAXVA, PAGE_SHIFT, PAGE_SIZE};

// ============================================================================
// Page Table Entry
// ============================================================================

bitflags! {
    /// Sv39 leaf flags plus the software paged-out bit
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const VALID     = 1 << 0;
        const READ      = 1 << 1;
        const WRITE     = 1 << 2;
        const EXEC      = 1 << 3;
        const USER      = 1 << 4;
        const GLOBAL    = 1 << 5;
        const ACCESSED  = 1 << 6;
        const DIRTY     = 1 << 7;
        /// Contents live in the swap file (RSW bit)
        const PAGED_OUT = 1 << 9;
    }
}

const FLAG_MASK: u64 = 0x3FF;
const PPN_SHIFT: u64 = 10;

/// Number of entries in one table page
pub const ENTRIES_PER_TABLE: usize = 512;

/// Page table entry
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Pte(pub u64);

impl Pte {
    /// Build an entry pointing at `pa`
    pub const fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        Self(((pa.0 >> PAGE_SHIFT) << PPN_SHIFT) | flags.bits())
    }

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Frame this entry points at
    pub const fn pa(self) -> PhysAddr {
        PhysAddr((self.0 >> PPN_SHIFT) << PAGE_SHIFT)
    }

    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & FLAG_MASK)
    }

    pub fn contains(self, flags: PteFlags) -> bool {
        self.flags().contains(flags)
    }

    pub fn is_valid(self) -> bool {
        self.contains(PteFlags::VALID)
    }

    pub fn is_paged_out(self) -> bool {
        self.contains(PteFlags::PAGED_OUT)
    }

    /// Valid with no permission bits means "points to the next level"
    pub fn is_leaf(self) -> bool {
        self.flags() != PteFlags::VALID
    }

    pub fn insert(&mut self, flags: PteFlags) {
        self.0 |= flags.bits();
    }

    pub fn remove(&mut self, flags: PteFlags) {
        self.0 &= !flags.bits();
    }

    /// Point the entry at a new frame, keeping its flags
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pte")
            .field("pa", &self.pa())
            .field("flags", &self.flags())
            .finish()
    }
}

// ============================================================================
// Page Table Trait
// ============================================================================

/// Translate/allocate/flush capability consumed by the paging engine
pub trait PageTable: Send {
    /// Return the leaf entry for `va`, creating intermediate levels when
    /// `alloc` is set. `None` means a level is missing (or could not be
    /// allocated). Panics if `va >= MAXVA`.
    fn walk(&mut self, va: VirtAddr, alloc: bool) -> Option<&mut Pte>;

    /// Read-only lookup of the leaf entry for `va`
    fn lookup(&self, va: VirtAddr) -> Option<Pte>;

    /// Drop any cached translation for `va`
    fn flush(&mut self, va: VirtAddr);

    /// Visit every leaf that is valid or paged out, in address order
    fn for_each_leaf(&self, f: &mut dyn FnMut(VirtAddr, Pte));

    /// Release all table pages. Panics if a leaf is still present.
    fn destroy(&mut self);

    /// Map `size` bytes at `va` to consecutive frames starting at `pa`.
    ///
    /// Fails with `OutOfMemory` if a table page cannot be allocated; pages
    /// mapped before the failure stay mapped.
    fn map(&mut self, va: VirtAddr, pa: PhysAddr, size: usize, flags: PteFlags) -> VmResult<()> {
        if size == 0 {
            panic!("mappages: size");
        }

        let last = trunc_page(va.0 + size as u64 - 1);
        let mut a = trunc_page(va.0);
        let mut frame = pa.0;
        loop {
            let pte = self.walk(VirtAddr(a), true).ok_or(VmError::OutOfMemory)?;
            if pte.is_valid() {
                panic!("mappages: remap {:#x}", a);
            }
            *pte = Pte::new(PhysAddr(frame), flags | PteFlags::VALID);
            if a == last {
                break;
            }
            a += PAGE_SIZE as u64;
            frame += PAGE_SIZE as u64;
        }
        Ok(())
    }

    /// Physical address of a valid user page (xv6 `walkaddr`)
    fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        if va.0 >= MAXVA {
            return None;
        }
        let pte = self.lookup(va)?;
        if !pte.is_valid() || !pte.contains(PteFlags::USER) {
            return None;
        }
        Some(pte.pa())
    }

    /// Record a reference the way the MMU would
    fn touch(&mut self, va: VirtAddr, write: bool) {
        if let Some(pte) = self.walk(va, false) {
            if pte.is_valid() {
                pte.insert(PteFlags::ACCESSED);
                if write {
                    pte.insert(PteFlags::DIRTY);
                }
            }
        }
    }
}

/// Flush one translation on the executing hart
#[inline]
pub fn sfence_vma(va: VirtAddr) {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("sfence.vma {}, zero", in(reg) va.0);
    }

    #[cfg(not(target_arch = "riscv64"))]
    let _ = va;
}

// ============================================================================
// Software Page Table
// ============================================================================

/// Radix page table kept in kernel heap.
///
/// Leaf tables are 512-entry pages keyed by their index above the leaf
/// level; upper levels are implicit. An optional budget caps how many leaf
/// tables may exist so table-page exhaustion can be exercised.
pub struct SoftPageTable {
    tables: BTreeMap<u64, Box<[Pte; ENTRIES_PER_TABLE]>>,
    table_budget: Option<usize>,
}

impl SoftPageTable {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            table_budget: None,
        }
    }

    /// Table that can hold at most `tables` leaf-table pages
    pub fn with_table_budget(tables: usize) -> Self {
        Self {
            table_budget: Some(tables),
            ..Self::new()
        }
    }

    /// Number of leaf-table pages currently allocated
    pub fn table_pages(&self) -> usize {
        self.tables.len()
    }

    fn split(va: VirtAddr) -> (u64, usize) {
        let vpn = va.vpn();
        (vpn >> 9, (vpn & (ENTRIES_PER_TABLE as u64 - 1)) as usize)
    }
}

impl Default for SoftPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable for SoftPageTable {
    fn walk(&mut self, va: VirtAddr, alloc: bool) -> Option<&mut Pte> {
        if va.0 >= MAXVA {
            panic!("walk: {:#x} beyond MAXVA", va.0);
        }

        let (table, index) = Self::split(va);
        if !self.tables.contains_key(&table) {
            if !alloc {
                return None;
            }
            if let Some(budget) = self.table_budget {
                if self.tables.len() >= budget {
                    return None;
                }
            }
            self.tables
                .insert(table, Box::new([Pte::empty(); ENTRIES_PER_TABLE]));
        }
        self.tables.get_mut(&table).map(|t| &mut t[index])
    }

    fn lookup(&self, va: VirtAddr) -> Option<Pte> {
        if va.0 >= MAXVA {
            panic!("walk: {:#x} beyond MAXVA", va.0);
        }
        let (table, index) = Self::split(va);
        self.tables.get(&table).map(|t| t[index])
    }

    fn flush(&mut self, va: VirtAddr) {
        sfence_vma(va);
    }

    fn for_each_leaf(&self, f: &mut dyn FnMut(VirtAddr, Pte)) {
        for (&table, entries) in &self.tables {
            for (index, &pte) in entries.iter().enumerate() {
                if pte.is_valid() || pte.is_paged_out() {
                    let vpn = (table << 9) | index as u64;
                    f(VirtAddr(vpn << PAGE_SHIFT), pte);
                }
            }
        }
    }

    fn destroy(&mut self) {
        let mut leaf = None;
        self.for_each_leaf(&mut |va, _| {
            leaf.get_or_insert(va);
        });
        if let Some(va) = leaf {
            panic!("freewalk: leaf {:#x}", va.0);
        }
        self.tables.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const RW_USER: PteFlags = PteFlags::READ.union(PteFlags::WRITE).union(PteFlags::USER);

    #[test]
    fn test_pte_encoding() {
        let pte = Pte::new(PhysAddr(0x8000_3000), RW_USER | PteFlags::VALID);
        assert_eq!(pte.pa(), PhysAddr(0x8000_3000));
        assert!(pte.is_valid());
        assert!(!pte.is_paged_out());
        assert!(pte.is_leaf());

        let mut pte = pte;
        pte.remove(PteFlags::VALID);
        pte.insert(PteFlags::PAGED_OUT);
        assert!(!pte.is_valid());
        assert!(pte.is_paged_out());
        assert_eq!(pte.pa(), PhysAddr(0x8000_3000));
    }

    #[test]
    fn test_map_and_translate() {
        let mut pt = SoftPageTable::new();
        pt.map(VirtAddr(0x2000), PhysAddr(0x8000_0000), PAGE_SIZE * 2, RW_USER)
            .unwrap();

        assert_eq!(pt.translate(VirtAddr(0x2000)), Some(PhysAddr(0x8000_0000)));
        assert_eq!(pt.translate(VirtAddr(0x3000)), Some(PhysAddr(0x8000_1000)));
        assert_eq!(pt.translate(VirtAddr(0x4000)), None);

        let mut leaves = alloc::vec::Vec::new();
        pt.for_each_leaf(&mut |va, _| leaves.push(va));
        assert_eq!(leaves, [VirtAddr(0x2000), VirtAddr(0x3000)]);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn test_remap_panics() {
        let mut pt = SoftPageTable::new();
        pt.map(VirtAddr(0), PhysAddr(0x8000_0000), PAGE_SIZE, RW_USER).unwrap();
        let _ = pt.map(VirtAddr(0), PhysAddr(0x8000_1000), PAGE_SIZE, RW_USER);
    }

    #[test]
    #[should_panic(expected = "MAXVA")]
    fn test_walk_beyond_maxva_panics() {
        let mut pt = SoftPageTable::new();
        let _ = pt.walk(VirtAddr(MAXVA), true);
    }

    #[test]
    fn test_table_budget() {
        let mut pt = SoftPageTable::with_table_budget(1);
        assert!(pt.walk(VirtAddr(0), true).is_some());
        // 512 pages later needs a second leaf table
        let far = VirtAddr((ENTRIES_PER_TABLE * PAGE_SIZE) as u64);
        assert!(pt.walk(far, true).is_none());
        assert_eq!(
            pt.map(far, PhysAddr(0x8000_0000), PAGE_SIZE, RW_USER),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(pt.table_pages(), 1);
    }

    #[test]
    fn test_touch_sets_hardware_bits() {
        let mut pt = SoftPageTable::new();
        pt.map(VirtAddr(0x1000), PhysAddr(0x8000_0000), PAGE_SIZE, RW_USER).unwrap();
        pt.touch(VirtAddr(0x1000), false);
        let pte = pt.lookup(VirtAddr(0x1000)).unwrap();
        assert!(pte.contains(PteFlags::ACCESSED));
        assert!(!pte.contains(PteFlags::DIRTY));
        pt.touch(VirtAddr(0x1000), true);
        assert!(pt.lookup(VirtAddr(0x1000)).unwrap().contains(PteFlags::DIRTY));
    }

    #[test]
    #[should_panic(expected = "freewalk: leaf")]
    fn test_destroy_with_leaf_panics() {
        let mut pt = SoftPageTable::new();
        pt.map(VirtAddr(0x1000), PhysAddr(0x8000_0000), PAGE_SIZE, RW_USER).unwrap();
        pt.destroy();
    }
}
