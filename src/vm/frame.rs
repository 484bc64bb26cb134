//! Physical Frame Allocation
//!
//! Hands out and reclaims page-sized physical frames. The pool is shared by
//! every process and guarded by its own lock; nothing in here knows about
//! processes or paging decisions.
//!
//! Frames are owned memory in this implementation so the engine can move
//! bytes between RAM and swap on a host. Freshly allocated frames are filled
//! with junk (5s) and freed frames with 1s, so code that reads memory it
//! does not own sees garbage rather than stale data.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::vm::addr::{PhysAddr, PAGE_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// Physical address of the first allocatable frame
pub const KERNBASE: u64 = 0x8000_0000;

const ALLOC_JUNK: u8 = 5;
const FREE_JUNK: u8 = 1;

// ============================================================================
// Frame Allocator Trait
// ============================================================================

/// Frame allocation capability consumed by the paging engine
pub trait FrameAllocator: Send + Sync {
    /// Take a free frame, `None` when memory is exhausted
    fn alloc_frame(&self) -> Option<PhysAddr>;

    /// Return a frame to the pool. Freeing an unowned frame is fatal.
    fn free_frame(&self, frame: PhysAddr);

    /// Copy a frame's contents out
    fn read_frame(&self, frame: PhysAddr, dst: &mut [u8]);

    /// Overwrite a frame's contents
    fn write_frame(&self, frame: PhysAddr, src: &[u8]);

    /// Number of frames still available
    fn free_count(&self) -> usize;

    fn zero_frame(&self, frame: PhysAddr) {
        self.write_frame(frame, &[0u8; PAGE_SIZE]);
    }

    fn copy_frame(&self, src: PhysAddr, dst: PhysAddr) {
        let mut buf = [0u8; PAGE_SIZE];
        self.read_frame(src, &mut buf);
        self.write_frame(dst, &buf);
    }
}

// ============================================================================
// Frame Pool
// ============================================================================

struct PoolState {
    /// Backing memory, indexed by frame number
    frames: Vec<Box<[u8; PAGE_SIZE]>>,
    /// Ownership bit per frame
    allocated: Vec<bool>,
    /// Free frame numbers, oldest first
    free_queue: VecDeque<u32>,
}

impl PoolState {
    fn index_of(&self, frame: PhysAddr) -> usize {
        if !frame.is_page_aligned() || frame.0 < KERNBASE {
            panic!("kfree: bad frame {:#x}", frame.0);
        }
        let index = ((frame.0 - KERNBASE) / PAGE_SIZE as u64) as usize;
        if index >= self.frames.len() {
            panic!("kfree: bad frame {:#x}", frame.0);
        }
        index
    }

    fn owned(&self, frame: PhysAddr) -> usize {
        let index = self.index_of(frame);
        if !self.allocated[index] {
            panic!("frame {:#x} is not allocated", frame.0);
        }
        index
    }
}

/// Fixed-size pool of physical frames behind a single lock
pub struct FramePool {
    state: Mutex<PoolState>,
    total: usize,
}

impl FramePool {
    /// Create a pool of `count` frames starting at `KERNBASE`
    pub fn new(count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        let mut free_queue = VecDeque::with_capacity(count);
        for i in 0..count {
            frames.push(Box::new([FREE_JUNK; PAGE_SIZE]));
            free_queue.push_back(i as u32);
        }

        Self {
            state: Mutex::new(PoolState {
                frames,
                allocated: alloc::vec![false; count],
                free_queue,
            }),
            total: count,
        }
    }

    /// Total frames managed
    pub fn total(&self) -> usize {
        self.total
    }

    /// Frames currently handed out
    pub fn allocated_count(&self) -> usize {
        self.total - self.free_count()
    }
}

impl FrameAllocator for FramePool {
    fn alloc_frame(&self) -> Option<PhysAddr> {
        let mut state = self.state.lock();
        let index = state.free_queue.pop_front()? as usize;
        state.allocated[index] = true;
        state.frames[index].fill(ALLOC_JUNK);
        Some(PhysAddr(KERNBASE + (index * PAGE_SIZE) as u64))
    }

    fn free_frame(&self, frame: PhysAddr) {
        let mut state = self.state.lock();
        let index = state.owned(frame);
        state.allocated[index] = false;
        state.frames[index].fill(FREE_JUNK);
        state.free_queue.push_back(index as u32);
    }

    fn read_frame(&self, frame: PhysAddr, dst: &mut [u8]) {
        let state = self.state.lock();
        let index = state.owned(frame);
        let len = dst.len().min(PAGE_SIZE);
        dst[..len].copy_from_slice(&state.frames[index][..len]);
    }

    fn write_frame(&self, frame: PhysAddr, src: &[u8]) {
        let mut state = self.state.lock();
        let index = state.owned(frame);
        let len = src.len().min(PAGE_SIZE);
        state.frames[index][..len].copy_from_slice(&src[..len]);
    }

    fn free_count(&self) -> usize {
        self.state.lock().free_queue.len()
    }
}

// ============================================================================
// Global State
// ============================================================================

static FRAME_POOL: spin::Once<Arc<FramePool>> = spin::Once::new();

/// Initialize the system frame pool. Later calls keep the first pool.
pub fn init_frame_pool(frames: usize) -> Arc<FramePool> {
    FRAME_POOL
        .call_once(|| {
            log::info!("frame pool: {} frames at {:#x}", frames, KERNBASE);
            Arc::new(FramePool::new(frames))
        })
        .clone()
}

/// The system frame pool
pub fn frame_pool() -> Arc<FramePool> {
    match FRAME_POOL.get() {
        Some(pool) => pool.clone(),
        None => panic!("frame pool not initialized"),
    }
}
