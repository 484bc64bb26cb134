//! End-to-end paging scenarios
//!
//! Processes built on the default limits (16 pages in RAM, 32 in total)
//! going through the same motions as the classic xv6 swap tests: sbrk past
//! the resident limit, touch everything, fork, exit.

use std::sync::Arc;

use swapvm::vm::{copy_in, copy_out, FrameAllocator, FramePool, PageTable, VirtAddr, PAGE_SIZE};
use swapvm::{
    admit_range, fork_copy, release_range, FaultKind, FaultResult, PagingConfig, Pid,
    PolicyKind, Process, VmError, MAX_PSYC_PAGES, MAX_TOTAL_PAGES,
};

const PG: u64 = PAGE_SIZE as u64;

fn pool(frames: usize) -> (Arc<FramePool>, Arc<dyn FrameAllocator>) {
    let pool = Arc::new(FramePool::new(frames));
    let frames: Arc<dyn FrameAllocator> = pool.clone();
    (pool, frames)
}

fn config(policy: PolicyKind) -> PagingConfig {
    PagingConfig::default().with_policy(policy)
}

/// Write `page`'s index at its start through the user-copy path
fn stamp_pages(p: &Process, pages: u64) {
    p.with_space(|s| {
        for page in 0..pages {
            copy_out(s, VirtAddr(page * PG), &page.to_le_bytes()).unwrap();
        }
    });
}

fn verify_pages(p: &Process, pages: u64) {
    p.with_space(|s| {
        for page in 0..pages {
            let mut buf = [0u8; 8];
            copy_in(s, &mut buf, VirtAddr(page * PG)).unwrap();
            assert_eq!(u64::from_le_bytes(buf), page, "page {} corrupted", page);
        }
    });
}

#[test]
fn sbrk_to_the_page_limit() {
    for policy in [PolicyKind::Nfua, PolicyKind::Lapa, PolicyKind::Scfifo] {
        let (pool, frames) = pool(128);
        let p = Process::new(Pid(100), config(policy), frames).unwrap();

        p.grow_by((MAX_TOTAL_PAGES as u64 * PG) as i64).unwrap();
        assert_eq!(p.memsize(), MAX_TOTAL_PAGES as u64 * PG);
        p.with_space(|s| {
            assert_eq!(s.resident_count(), MAX_PSYC_PAGES);
            assert_eq!(s.swapped_count(), MAX_TOTAL_PAGES - MAX_PSYC_PAGES);
        });
        assert_eq!(pool.allocated_count(), MAX_PSYC_PAGES);

        // One more page does not fit
        assert_eq!(
            p.grow_by(PG as i64),
            Err(VmError::TooManyPages {
                limit: MAX_TOTAL_PAGES
            })
        );
        assert_eq!(p.memsize(), MAX_TOTAL_PAGES as u64 * PG);

        stamp_pages(&p, MAX_TOTAL_PAGES as u64);
        verify_pages(&p, MAX_TOTAL_PAGES as u64);
        p.with_space(|s| s.check_invariants());
        assert!(p.stats().page_ins > 0);

        p.exit();
        assert_eq!(pool.allocated_count(), 0);
    }
}

#[test]
fn fork_duplicates_swapped_memory() {
    let (pool, frames) = pool(128);
    let parent = Process::new(Pid(200), config(PolicyKind::Scfifo), frames).unwrap();
    parent.grow_by(24 * PG as i64).unwrap();
    stamp_pages(&parent, 24);

    let child = parent.fork(Pid(201)).unwrap();
    verify_pages(&child, 24);

    // The child's writes never reach the parent, in RAM or in swap
    child.with_space(|s| {
        for page in 0..24u64 {
            copy_out(s, VirtAddr(page * PG), &u64::MAX.to_le_bytes()).unwrap();
        }
    });
    verify_pages(&parent, 24);

    child.exit();
    parent.with_space(|s| s.check_invariants());
    parent.exit();
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn os_processes_never_page() {
    let (pool, frames) = pool(64);
    let shell = Process::new(Pid(2), config(PolicyKind::Nfua), frames).unwrap();
    shell.grow_by(40 * PG as i64).unwrap();
    shell.with_space(|s| {
        assert!(!s.is_paging());
        assert_eq!(s.swapped_count(), 0);
        s.check_invariants();
    });
    assert_eq!(pool.allocated_count(), 40);

    // Its children are user processes and do page
    let err = shell.fork(Pid(3)).unwrap_err();
    assert_eq!(
        err,
        VmError::TooManyPages {
            limit: MAX_TOTAL_PAGES
        }
    );
    assert_eq!(pool.allocated_count(), 40);

    shell.exit();
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn fork_from_shell_admits_pages() {
    let (pool, frames) = pool(64);
    let shell = Process::new(Pid(2), config(PolicyKind::Lapa), frames).unwrap();
    shell.grow_by(20 * PG as i64).unwrap();
    stamp_pages(&shell, 20);

    let child = shell.fork(Pid(3)).unwrap();
    child.with_space(|s| {
        assert!(s.is_paging());
        assert_eq!(s.resident_count(), MAX_PSYC_PAGES);
        assert_eq!(s.swapped_count(), 4);
        s.check_invariants();
    });
    verify_pages(&child, 20);

    child.exit();
    shell.exit();
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn none_policy_disables_paging() {
    let (pool, frames) = pool(64);
    let p = Process::new(Pid(300), config(PolicyKind::None), frames).unwrap();
    assert!(!p.is_paging());

    p.grow_by(40 * PG as i64).unwrap();
    assert_eq!(pool.allocated_count(), 40);
    assert_eq!(p.tick(), 0);
    p.exit();
}

#[test]
fn out_of_frames_leaves_process_intact() {
    let (pool, frames) = pool(6);
    let p = Process::new(Pid(400), config(PolicyKind::Nfua), frames).unwrap();
    p.grow_by(4 * PG as i64).unwrap();

    assert_eq!(p.grow_by(4 * PG as i64), Err(VmError::OutOfMemory));
    assert_eq!(p.memsize(), 4 * PG);
    assert_eq!(pool.allocated_count(), 4);
    p.with_space(|s| s.check_invariants());
}

#[test]
fn nfua_keeps_hot_pages_resident() {
    let (_pool, frames) = pool(64);
    let cfg = PagingConfig::new(4, 4, PolicyKind::Nfua);
    let p = Process::new(Pid(500), cfg, frames).unwrap();
    p.grow_by(4 * PG as i64).unwrap();

    // Pages 0 and 1 are referenced every tick, 2 and 3 never
    for _ in 0..8 {
        p.with_space(|s| {
            s.page_table_mut().touch(VirtAddr(0), false);
            s.page_table_mut().touch(VirtAddr(PG), true);
        });
        p.tick();
    }

    p.grow_by(2 * PG as i64).unwrap();
    p.with_space(|s| {
        assert!(s.walk_addr(VirtAddr(0)).is_some());
        assert!(s.walk_addr(VirtAddr(PG)).is_some());
        assert!(s.walk_addr(VirtAddr(2 * PG)).is_none());
        assert!(s.walk_addr(VirtAddr(3 * PG)).is_none());
        s.check_invariants();
    });

    assert_eq!(
        p.page_fault(VirtAddr(3 * PG + 8), FaultKind::Store),
        Ok(FaultResult::PagedIn)
    );
    assert_eq!(p.stats().ticks, 8);
}

#[test]
fn range_calls_track_process_size() {
    let (pool, frames) = pool(128);
    let p = Process::new(Pid(600), config(PolicyKind::Scfifo), frames).unwrap();

    assert_eq!(admit_range(&p, 0, 20 * PG), Ok(20 * PG));
    assert_eq!(p.memsize(), 20 * PG);
    assert_eq!(p.grow_by(4 * PG as i64), Ok(20 * PG));
    stamp_pages(&p, 24);

    assert_eq!(release_range(&p, 18 * PG, 24 * PG), Ok(18 * PG));
    assert_eq!(p.memsize(), 18 * PG);
    assert_eq!(admit_range(&p, 18 * PG, 22 * PG), Ok(22 * PG));
    verify_pages(&p, 18);

    let child = p.fork(Pid(601)).unwrap();
    assert_eq!(child.memsize(), 22 * PG);
    verify_pages(&child, 18);
    child.with_space(|s| {
        assert_eq!(s.ledger().tracked_count(), 22);
        s.check_invariants();
    });

    child.exit();
    p.exit();
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn fork_copy_into_fresh_process_then_exit() {
    let (pool, frames) = pool(128);
    let parent = Process::new(Pid(610), config(PolicyKind::Nfua), frames.clone()).unwrap();
    admit_range(&parent, 0, 24 * PG).unwrap();
    stamp_pages(&parent, 24);

    let child = Process::new(Pid(611), config(PolicyKind::Nfua), frames).unwrap();
    fork_copy(&parent, &child, 24 * PG).unwrap();
    assert_eq!(child.memsize(), 24 * PG);
    verify_pages(&child, 24);

    release_range(&child, 8 * PG, 24 * PG).unwrap();
    child.exit();
    parent.exit();
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn fork_races_with_sbrk() {
    let (pool, frames) = pool(256);
    let cfg = PagingConfig::new(4, 8, PolicyKind::Scfifo);
    let parent = Process::new(Pid(700), cfg, frames).unwrap();
    parent.grow_by(8 * PG as i64).unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..200 {
                parent.grow_by(-(4 * PG as i64)).unwrap();
                parent.grow_by(4 * PG as i64).unwrap();
            }
        });
        scope.spawn(|| {
            for i in 0..200 {
                let child = parent.fork(Pid(701 + i)).unwrap();
                child.with_space(|s| {
                    assert_eq!(s.ledger().tracked_count() as u64 * PG, child.memsize());
                    s.check_invariants();
                });
                child.exit();
            }
        });
    });

    assert_eq!(parent.memsize(), 8 * PG);
    parent.exit();
    assert_eq!(pool.allocated_count(), 0);
}
