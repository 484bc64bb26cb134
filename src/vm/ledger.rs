//! Frame Accounting Ledger
//!
//! Per-process record of every user page subject to paging: where it lives
//! (RAM or swap), its policy recency value and, when swapped out, which
//! swap slot holds it.
//!
//! Entries sit in a fixed-capacity arena addressed by stable `PageHandle`s.
//! Arena order is the tie-break order for the replacement policies, so the
//! arena is never compacted; a hash index gives O(1) lookup by address.
//!
//! Transitions: `Free -> Resident <-> SwappedOut -> Free`. Counters change
//! in the same call as the state, and every illegal transition panics.

use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::vm::addr::VirtAddr;
use crate::vm::swap::SwapSlot;

// ============================================================================
// Tracked Page
// ============================================================================

/// Where a tracked page's contents are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Entry unused
    Free,
    /// In a physical frame, PTE valid
    Resident,
    /// In a swap slot, PTE paged out
    SwappedOut,
}

/// Stable index of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageHandle(pub usize);

/// One user page under paging control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedPage {
    va: VirtAddr,
    state: PageState,
    recency: u64,
    slot: Option<SwapSlot>,
}

impl TrackedPage {
    const fn free() -> Self {
        Self {
            va: VirtAddr(0),
            state: PageState::Free,
            recency: 0,
            slot: None,
        }
    }

    pub fn va(&self) -> VirtAddr {
        self.va
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    /// Policy-defined recency value
    pub fn recency(&self) -> u64 {
        self.recency
    }

    /// Swap slot held while swapped out
    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    pub fn is_resident(&self) -> bool {
        self.state == PageState::Resident
    }

    pub fn is_swapped(&self) -> bool {
        self.state == PageState::SwappedOut
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Per-process page accounting table
#[derive(Debug, Clone)]
pub struct Ledger {
    pages: Vec<TrackedPage>,
    index: HashMap<VirtAddr, PageHandle>,
    max_resident: usize,
    resident_count: usize,
    swapped_count: usize,
    /// Logical clock for second-chance FIFO
    generation: u64,
}

impl Ledger {
    /// Table sized for `max_resident` pages in RAM and `max_swap` in swap
    pub fn new(max_resident: usize, max_swap: usize) -> Self {
        let capacity = max_resident + max_swap;
        Self {
            pages: alloc::vec![TrackedPage::free(); capacity],
            index: HashMap::with_capacity(capacity),
            max_resident,
            resident_count: 0,
            swapped_count: 0,
            generation: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    pub fn max_resident(&self) -> usize {
        self.max_resident
    }

    pub fn resident_count(&self) -> usize {
        self.resident_count
    }

    pub fn swapped_count(&self) -> usize {
        self.swapped_count
    }

    /// Pages in any non-free state
    pub fn tracked_count(&self) -> usize {
        self.resident_count + self.swapped_count
    }

    /// No entry left for another page
    pub fn is_full(&self) -> bool {
        self.tracked_count() == self.capacity()
    }

    /// Resident set is at its ceiling
    pub fn resident_full(&self) -> bool {
        self.resident_count == self.max_resident
    }

    pub fn get(&self, handle: PageHandle) -> &TrackedPage {
        &self.pages[handle.0]
    }

    /// Entries in table order
    pub fn iter(&self) -> impl Iterator<Item = (PageHandle, &TrackedPage)> + '_ {
        self.pages
            .iter()
            .enumerate()
            .map(|(i, page)| (PageHandle(i), page))
    }

    /// Resident entries in table order
    pub fn resident(&self) -> impl Iterator<Item = (PageHandle, &TrackedPage)> + '_ {
        self.iter().filter(|(_, page)| page.is_resident())
    }

    /// First free entry, if any
    pub fn reserve_slot(&self) -> Option<PageHandle> {
        self.pages
            .iter()
            .position(|page| page.state == PageState::Free)
            .map(PageHandle)
    }

    pub fn find_by_address(&self, va: VirtAddr) -> Option<PageHandle> {
        self.index.get(&va).copied()
    }

    /// Bring an entry into RAM: `Free -> Resident` for a new page,
    /// `SwappedOut -> Resident` for a page coming back from swap.
    ///
    /// The caller must have made room first and must already have disposed
    /// of the swap slot of a returning page.
    pub fn mark_resident(&mut self, handle: PageHandle, va: VirtAddr) {
        if self.resident_count >= self.max_resident {
            panic!(
                "ledger: resident set full ({}) admitting {:#x}",
                self.max_resident, va.0
            );
        }

        let page = &mut self.pages[handle.0];
        match page.state {
            PageState::Free => {
                if let Some(other) = self.index.get(&va) {
                    panic!("ledger: {:#x} already tracked by entry {}", va.0, other.0);
                }
                self.index.insert(va, handle);
                page.va = va;
            }
            PageState::SwappedOut => {
                if page.va != va {
                    panic!("ledger: entry {} holds {:#x}, not {:#x}", handle.0, page.va.0, va.0);
                }
                self.swapped_count -= 1;
            }
            PageState::Resident => {
                panic!("ledger: {:#x} is already resident", page.va.0);
            }
        }

        page.state = PageState::Resident;
        page.slot = None;
        self.resident_count += 1;
    }

    /// Record that a resident page now lives in `slot`
    pub fn mark_swapped(&mut self, handle: PageHandle, va: VirtAddr, slot: SwapSlot) {
        let page = &mut self.pages[handle.0];
        if page.state != PageState::Resident || page.va != va {
            panic!(
                "ledger: swapping out {:#x} from entry {} in state {:?}",
                va.0, handle.0, page.state
            );
        }

        page.state = PageState::SwappedOut;
        page.slot = Some(slot);
        self.resident_count -= 1;
        self.swapped_count += 1;
    }

    /// Return an entry to `Free`, handing back what it held
    pub fn release(&mut self, handle: PageHandle) -> TrackedPage {
        let page = core::mem::replace(&mut self.pages[handle.0], TrackedPage::free());
        match page.state {
            PageState::Free => panic!("ledger: releasing free entry {}", handle.0),
            PageState::Resident => self.resident_count -= 1,
            PageState::SwappedOut => self.swapped_count -= 1,
        }
        self.index.remove(&page.va);
        page
    }

    /// Install a copy of another ledger's entry at the same position (fork)
    pub fn adopt(&mut self, handle: PageHandle, page: &TrackedPage) {
        if self.pages[handle.0].state != PageState::Free {
            panic!("ledger: adopting into busy entry {}", handle.0);
        }
        match page.state {
            PageState::Free => panic!("ledger: adopting a free entry"),
            PageState::Resident => {
                if self.resident_count >= self.max_resident {
                    panic!("ledger: resident set full adopting {:#x}", page.va.0);
                }
                self.resident_count += 1;
            }
            PageState::SwappedOut => self.swapped_count += 1,
        }
        if self.index.insert(page.va, handle).is_some() {
            panic!("ledger: {:#x} already tracked", page.va.0);
        }
        self.pages[handle.0] = page.clone();
    }

    pub fn set_recency(&mut self, handle: PageHandle, value: u64) {
        self.pages[handle.0].recency = value;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Advance the logical clock and return the new time
    pub fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(page: u64) -> VirtAddr {
        VirtAddr(page * 0x1000)
    }

    #[test]
    fn test_reserve_and_mark() {
        let mut ledger = Ledger::new(2, 2);
        assert_eq!(ledger.capacity(), 4);

        let h = ledger.reserve_slot().unwrap();
        assert_eq!(h, PageHandle(0));
        ledger.mark_resident(h, va(1));
        assert_eq!(ledger.resident_count(), 1);
        assert_eq!(ledger.find_by_address(va(1)), Some(h));
        assert_eq!(ledger.reserve_slot(), Some(PageHandle(1)));
    }

    #[test]
    fn test_swap_cycle() {
        let mut ledger = Ledger::new(1, 1);
        let h = ledger.reserve_slot().unwrap();
        ledger.mark_resident(h, va(3));
        ledger.mark_swapped(h, va(3), SwapSlot(0));
        assert_eq!(ledger.resident_count(), 0);
        assert_eq!(ledger.swapped_count(), 1);
        assert_eq!(ledger.get(h).slot(), Some(SwapSlot(0)));

        ledger.mark_resident(h, va(3));
        assert_eq!(ledger.get(h).state(), PageState::Resident);
        assert_eq!(ledger.get(h).slot(), None);
        assert_eq!(ledger.swapped_count(), 0);

        let old = ledger.release(h);
        assert_eq!(old.va(), va(3));
        assert_eq!(ledger.tracked_count(), 0);
        assert_eq!(ledger.find_by_address(va(3)), None);
    }

    #[test]
    fn test_full_table() {
        let mut ledger = Ledger::new(1, 1);
        let a = ledger.reserve_slot().unwrap();
        ledger.mark_resident(a, va(1));
        ledger.mark_swapped(a, va(1), SwapSlot(0));
        let b = ledger.reserve_slot().unwrap();
        ledger.mark_resident(b, va(2));
        assert!(ledger.is_full());
        assert!(ledger.resident_full());
        assert_eq!(ledger.reserve_slot(), None);
    }

    #[test]
    fn test_resident_in_table_order() {
        let mut ledger = Ledger::new(3, 0);
        for page in [7, 5, 6] {
            let h = ledger.reserve_slot().unwrap();
            ledger.mark_resident(h, va(page));
        }
        let order: Vec<_> = ledger.resident().map(|(_, p)| p.va()).collect();
        assert_eq!(order, [va(7), va(5), va(6)]);
    }

    #[test]
    fn test_adopt_keeps_position() {
        let mut parent = Ledger::new(2, 2);
        let a = parent.reserve_slot().unwrap();
        parent.mark_resident(a, va(1));
        let b = parent.reserve_slot().unwrap();
        parent.mark_resident(b, va(2));
        parent.mark_swapped(a, va(1), SwapSlot(1));
        parent.set_recency(b, 42);

        let mut child = Ledger::new(2, 2);
        for (h, page) in parent.iter().filter(|(_, p)| p.state() != PageState::Free) {
            child.adopt(h, page);
        }
        assert_eq!(child.resident_count(), 1);
        assert_eq!(child.swapped_count(), 1);
        assert_eq!(child.get(b).recency(), 42);
        assert_eq!(child.find_by_address(va(1)), Some(a));
    }

    #[test]
    #[should_panic(expected = "already tracked")]
    fn test_duplicate_address_panics() {
        let mut ledger = Ledger::new(2, 0);
        let a = ledger.reserve_slot().unwrap();
        ledger.mark_resident(a, va(1));
        let b = ledger.reserve_slot().unwrap();
        ledger.mark_resident(b, va(1));
    }

    #[test]
    #[should_panic(expected = "resident set full")]
    fn test_over_admit_panics() {
        let mut ledger = Ledger::new(1, 1);
        let a = ledger.reserve_slot().unwrap();
        ledger.mark_resident(a, va(1));
        let b = ledger.reserve_slot().unwrap();
        ledger.mark_resident(b, va(2));
    }

    #[test]
    #[should_panic(expected = "releasing free")]
    fn test_release_free_panics() {
        let mut ledger = Ledger::new(1, 0);
        ledger.release(PageHandle(0));
    }

    #[test]
    fn test_generation_clock() {
        let mut ledger = Ledger::new(1, 0);
        assert_eq!(ledger.next_generation(), 1);
        assert_eq!(ledger.next_generation(), 2);
        ledger.set_generation(10);
        assert_eq!(ledger.generation(), 10);
    }
}
