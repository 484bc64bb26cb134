//! The console log sink sees what the pager does

use std::sync::Arc;

use swapvm::console;
use swapvm::vm::{FrameAllocator, FramePool, PAGE_SIZE};
use swapvm::{PagingConfig, Pid, PolicyKind, Process};

#[test]
fn evictions_and_page_ins_are_logged() {
    assert!(console::init(log::LevelFilter::Debug));

    let frames: Arc<dyn FrameAllocator> = Arc::new(FramePool::new(16));
    let config = PagingConfig::new(1, 2, PolicyKind::Scfifo);
    let p = Process::new(Pid(600), config, frames).unwrap();
    p.grow_by(2 * PAGE_SIZE as i64).unwrap();
    swapvm::fault_in(&p, swapvm::vm::VirtAddr(0)).unwrap();

    let log = console::console();
    assert!(log.contains("pid 600: paging true"));
    assert!(log.contains("[DEBUG swapvm::vm::space] evict: 0x0 -> swap slot 0"));
    assert!(log.contains("fault_in: 0x0 <- swap slot 0"));

    log::set_max_level(log::LevelFilter::Warn);
    let before = log.len();
    p.exit();
    assert_eq!(log.len(), before);
}
