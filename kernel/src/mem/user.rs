//! Kernel access to user memory.
//!
//! Pointers handed in by user programs are checked against the process's
//! page table, and copies go through the same fault path a user access
//! would, so they load non-resident pages and set accessed and dirty bits.

use super::{fault::handle_fault, page_table::SupplementalPageTable, Result, VmError};
use alloc::{vec, vec::Vec};
use core::cmp::min;
use kidneyos_vm_shared::mem::{page_offset, page_round_down, OFFSET, PAGE_FRAME_SIZE};

/// Whether every byte of `[pointer, pointer + count)` lies in a page the
/// process knows about.
pub fn check_user_range(pages: &SupplementalPageTable, pointer: usize, count: usize) -> bool {
    if pointer == 0 {
        return false;
    }
    let Some(range_end) = pointer.checked_add(count) else {
        return false;
    };
    // Trying to reach kernel memory.
    if range_end > OFFSET || pointer >= OFFSET {
        return false;
    }
    if count == 0 {
        return true;
    }
    (page_round_down(pointer)..range_end)
        .step_by(PAGE_FRAME_SIZE)
        .all(|vpn| pages.contains(vpn))
}

/// Run `f` on the page holding `vaddr`, faulting it in first if needed.
fn with_user_page<R>(
    pages: &SupplementalPageTable,
    vaddr: usize,
    write: bool,
    mut f: impl FnMut(&mut [u8; PAGE_FRAME_SIZE]) -> R,
) -> Result<R> {
    loop {
        if let Some(result) = pages
            .frames()
            .access(&**pages.space(), vaddr, write, &mut f)
        {
            return Ok(result);
        }
        // Evicted again between the fault and the access: go round.
        handle_fault(pages, vaddr, write)?;
    }
}

/// Split `[start, start + len)` at page boundaries.
fn chunks(start: usize, len: usize) -> impl Iterator<Item = (usize, usize)> {
    let mut done = 0;
    core::iter::from_fn(move || {
        if done == len {
            return None;
        }
        let offset = page_offset(start + done);
        let count = min(PAGE_FRAME_SIZE - offset, len - done);
        let chunk = (done, count);
        done += count;
        Some(chunk)
    })
}

pub fn copy_from_user(pages: &SupplementalPageTable, src: usize, buf: &mut [u8]) -> Result<()> {
    if !check_user_range(pages, src, buf.len()) {
        return Err(VmError::BadAddress);
    }
    for (done, count) in chunks(src, buf.len()) {
        let vaddr = src + done;
        let offset = page_offset(vaddr);
        let dst = &mut buf[done..done + count];
        with_user_page(pages, vaddr, false, |page| {
            dst.copy_from_slice(&page[offset..offset + count])
        })?;
    }
    Ok(())
}

pub fn copy_to_user(pages: &SupplementalPageTable, dst: usize, bytes: &[u8]) -> Result<()> {
    if !check_user_range(pages, dst, bytes.len()) {
        return Err(VmError::BadAddress);
    }
    for (done, count) in chunks(dst, bytes.len()) {
        let vaddr = dst + done;
        let offset = page_offset(vaddr);
        let src = &bytes[done..done + count];
        with_user_page(pages, vaddr, true, |page| {
            page[offset..offset + count].copy_from_slice(src)
        })?;
    }
    Ok(())
}

/// Copy `count` bytes at `pointer` out of user memory.
///
/// We sometimes want to hand data from one thread to another. Copying it to
/// kernel memory first avoids mapping it into both.
pub fn check_and_copy_user_memory(
    pages: &SupplementalPageTable,
    pointer: usize,
    count: usize,
) -> Option<Vec<u8>> {
    let mut bytes = vec![0; count];
    copy_from_user(pages, pointer, &mut bytes).ok()?;
    Some(bytes)
}
