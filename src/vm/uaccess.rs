//! Copyin/Copyout - User <-> Kernel Data Transfer
//!
//! Copies between kernel buffers and a process's user address space one
//! page at a time. With demand paging a user buffer may sit partly in swap,
//! so each page is faulted in before it is touched. Every access marks the
//! page accessed (and dirty for writes) the way the MMU would, which keeps
//! the aging policies honest about kernel-side references.

use crate::error::{VmError, VmResult};
use crate::vm::addr::{PhysAddr, VirtAddr, MAXVA, PAGE_SIZE};
use crate::vm::pmap::PteFlags;
use crate::vm::space::AddressSpace;

/// Make the page holding `va` resident and return its frame
fn user_page(space: &mut AddressSpace, va: VirtAddr, write: bool) -> VmResult<PhysAddr> {
    let page = va.page_round_down();
    if page.0 >= MAXVA {
        return Err(VmError::BadAddress(va));
    }

    let pte = space
        .page_table()
        .lookup(page)
        .ok_or(VmError::BadAddress(va))?;
    if !pte.contains(PteFlags::USER) || (write && !pte.contains(PteFlags::WRITE)) {
        return Err(VmError::BadAddress(va));
    }
    if pte.is_paged_out() {
        space.fault_in(page)?;
    }

    let pa = space.walk_addr(page).ok_or(VmError::BadAddress(va))?;
    space.page_table_mut().touch(page, write);
    Ok(pa)
}

/// Copy `src` to user address `dst`
pub fn copy_out(space: &mut AddressSpace, dst: VirtAddr, src: &[u8]) -> VmResult<()> {
    let mut done = 0;
    let mut page = [0u8; PAGE_SIZE];

    while done < src.len() {
        let va = VirtAddr(dst.0 + done as u64);
        let pa = user_page(space, va, true)?;
        let offset = va.page_offset();
        let n = (PAGE_SIZE - offset).min(src.len() - done);

        space.frames().read_frame(pa, &mut page);
        page[offset..offset + n].copy_from_slice(&src[done..done + n]);
        space.frames().write_frame(pa, &page);
        done += n;
    }
    Ok(())
}

/// Fill `dst` from user address `src`
pub fn copy_in(space: &mut AddressSpace, dst: &mut [u8], src: VirtAddr) -> VmResult<()> {
    let mut done = 0;
    let mut page = [0u8; PAGE_SIZE];

    while done < dst.len() {
        let va = VirtAddr(src.0 + done as u64);
        let pa = user_page(space, va, false)?;
        let offset = va.page_offset();
        let n = (PAGE_SIZE - offset).min(dst.len() - done);

        space.frames().read_frame(pa, &mut page);
        dst[done..done + n].copy_from_slice(&page[offset..offset + n]);
        done += n;
    }
    Ok(())
}

/// Copy a NUL-terminated string from user address `src` into `dst`.
///
/// Returns the string length without the terminator, which is copied too.
/// Fails if no NUL appears within `dst.len()` bytes.
pub fn copy_in_str(space: &mut AddressSpace, dst: &mut [u8], src: VirtAddr) -> VmResult<usize> {
    let max = dst.len();
    let mut done = 0;
    let mut page = [0u8; PAGE_SIZE];

    while done < max {
        let va = VirtAddr(src.0 + done as u64);
        let pa = user_page(space, va, false)?;
        let offset = va.page_offset();
        let n = (PAGE_SIZE - offset).min(max - done);

        space.frames().read_frame(pa, &mut page);
        for &byte in &page[offset..offset + n] {
            dst[done] = byte;
            if byte == 0 {
                return Ok(done);
            }
            done += 1;
        }
    }
    Err(VmError::Unterminated { max })
}
