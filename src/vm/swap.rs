//! Swap Backing Adapter
//!
//! Each paging process owns a swap file divided into page-sized slots.
//! Slot N lives at byte offset `N * PAGE_SIZE` and holds a verbatim copy of
//! whatever page was last evicted into it. `SwapSpace` tracks which slots
//! are owned and performs the transfers; `SwapStore` is the byte device
//! underneath.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::SwapIoError;
use crate::vm::addr::PAGE_SIZE;

// ============================================================================
// Swap Store
// ============================================================================

/// Byte-addressable backing store for one process's swap file.
///
/// A failed `write` must leave the previous contents of the target slot
/// intact; the engine relies on this when it swaps a victim into the slot
/// of the page being faulted in.
pub trait SwapStore: Send {
    fn write(&mut self, src: &[u8], offset: usize) -> Result<(), SwapIoError>;
    fn read(&mut self, dst: &mut [u8], offset: usize) -> Result<(), SwapIoError>;
}

/// Swap file kept in kernel memory
pub struct MemSwapFile {
    data: Vec<u8>,
}

impl MemSwapFile {
    /// Swap file with room for `slots` pages
    pub fn new(slots: usize) -> Self {
        Self {
            data: vec![0u8; slots * PAGE_SIZE],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn range(&self, offset: usize, len: usize) -> Result<core::ops::Range<usize>, SwapIoError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(offset..end),
            _ => Err(SwapIoError { offset, len }),
        }
    }
}

impl SwapStore for MemSwapFile {
    fn write(&mut self, src: &[u8], offset: usize) -> Result<(), SwapIoError> {
        let range = self.range(offset, src.len())?;
        self.data[range].copy_from_slice(src);
        Ok(())
    }

    fn read(&mut self, dst: &mut [u8], offset: usize) -> Result<(), SwapIoError> {
        let range = self.range(offset, dst.len())?;
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }
}

// ============================================================================
// Swap Slots
// ============================================================================

/// Index of a page-sized slot in the swap file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub usize);

impl SwapSlot {
    /// Byte offset of the slot in the swap file
    pub const fn offset(self) -> usize {
        self.0 * PAGE_SIZE
    }
}

/// Per-process swap slot pool plus its backing store
pub struct SwapSpace {
    used: Vec<bool>,
    in_use: usize,
    store: Box<dyn SwapStore>,
}

impl SwapSpace {
    /// Slot pool of `slots` entries over `store`
    pub fn new(slots: usize, store: Box<dyn SwapStore>) -> Self {
        Self {
            used: vec![false; slots],
            in_use: 0,
            store,
        }
    }

    /// Slot pool backed by an in-memory swap file
    pub fn in_memory(slots: usize) -> Self {
        Self::new(slots, Box::new(MemSwapFile::new(slots)))
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn free_slots(&self) -> usize {
        self.capacity() - self.in_use
    }

    pub fn is_claimed(&self, slot: SwapSlot) -> bool {
        self.used.get(slot.0).copied().unwrap_or(false)
    }

    /// Take the lowest free slot
    pub fn claim(&mut self) -> Option<SwapSlot> {
        let index = self.used.iter().position(|&u| !u)?;
        self.used[index] = true;
        self.in_use += 1;
        Some(SwapSlot(index))
    }

    /// Take a specific slot. Panics if it is already owned.
    pub fn claim_at(&mut self, slot: SwapSlot) {
        if self.used[slot.0] {
            panic!("swap slot {} already claimed", slot.0);
        }
        self.used[slot.0] = true;
        self.in_use += 1;
    }

    /// Give a slot back. Panics if it was not owned.
    pub fn release(&mut self, slot: SwapSlot) {
        if !self.used[slot.0] {
            panic!("swap slot {} released twice", slot.0);
        }
        self.used[slot.0] = false;
        self.in_use -= 1;
    }

    /// Write one page into `slot`
    pub fn store(&mut self, slot: SwapSlot, page: &[u8]) -> Result<(), SwapIoError> {
        self.store.write(&page[..PAGE_SIZE], slot.offset())
    }

    /// Read one page out of `slot`
    pub fn load(&mut self, slot: SwapSlot, page: &mut [u8]) -> Result<(), SwapIoError> {
        self.store.read(&mut page[..PAGE_SIZE], slot.offset())
    }
}
