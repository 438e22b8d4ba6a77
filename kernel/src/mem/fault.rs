//! Resolving user page faults.

use super::{
    page_table::{Backing, PageKind, SupplementalPageTable},
    PhysFrame, Result, VmError,
};
use kidneyos_vm_shared::mem::{is_user_vaddr, page_round_down, OFFSET, STACK_LIMIT, STACK_SLACK};

/// Bring in the page covering `addr`.
///
/// Fails with [`VmError::NotMapped`] if the process has no such page, and with
/// [`VmError::ReadOnly`] for a write to a read-only page. Any other error
/// means the page could not be loaded and the process should be killed.
pub fn handle_fault(pages: &SupplementalPageTable, addr: usize, write: bool) -> Result<PhysFrame> {
    let entry = pages.lookup(addr).ok_or(VmError::NotMapped)?;
    if write && !entry.writable() {
        return Err(VmError::ReadOnly);
    }
    pages.frames().load(pages.space(), &entry)
}

/// Add a fresh stack page covering `fault_addr` if the access looks like a
/// push relative to the user stack pointer `esp`.
pub fn grow_stack(
    pages: &SupplementalPageTable,
    fault_addr: usize,
    esp: usize,
) -> Result<PhysFrame> {
    let in_stack_region = is_user_vaddr(fault_addr) && fault_addr >= OFFSET - STACK_LIMIT;
    let near_esp = fault_addr.saturating_add(STACK_SLACK) >= esp;
    if !in_stack_region || !near_esp {
        return Err(VmError::NotMapped);
    }

    let entry = pages.create(
        page_round_down(fault_addr),
        PageKind::SwapBacked,
        true,
        Backing::Anonymous,
    )?;
    pages.insert(entry.clone())?;
    log::debug!(
        "grew stack of space {} to {:#X}",
        pages.space().id(),
        entry.vpn()
    );
    pages.frames().load(pages.space(), &entry)
}

/// Handle a page fault taken in user mode.
pub fn handle_user_fault(
    pages: &SupplementalPageTable,
    addr: usize,
    write: bool,
    esp: usize,
) -> Result<()> {
    let result = match handle_fault(pages, addr, write) {
        Err(VmError::NotMapped) => grow_stack(pages, addr, esp),
        other => other,
    };
    if let Err(err) = result {
        log::debug!(
            "unresolved {} fault at {:#X} in space {}: {}",
            if write { "write" } else { "read" },
            addr,
            pages.space().id(),
            err
        );
    }
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::frame_table::tests::vm_with;
    use crate::mem::page_table::Location;
    use crate::paging::PageMap;
    use alloc::sync::Arc;
    use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;

    fn table() -> SupplementalPageTable {
        let (frames, _, _) = vm_with(4, 4);
        SupplementalPageTable::new(Arc::new(PageMap::new(1)), frames)
    }

    #[test]
    fn faults_load_known_pages() {
        let pages = table();
        let entry = pages
            .create(0x0804_8000, PageKind::FileBacked, false, Backing::Anonymous)
            .unwrap();
        pages.insert(entry.clone()).unwrap();

        assert_eq!(handle_fault(&pages, 0x0804_9000, false), Err(VmError::NotMapped));
        assert_eq!(handle_fault(&pages, 0x0804_8010, true), Err(VmError::ReadOnly));
        let frame = handle_fault(&pages, 0x0804_8010, false).unwrap();
        assert_eq!(entry.location(), Location::Resident(frame));
        assert_eq!(pages.space().translate(0x0804_8000, false), Some(frame));
    }

    #[test]
    fn pushes_grow_the_stack() {
        let pages = table();
        let esp = OFFSET - 64;
        handle_user_fault(&pages, esp - 4, true, esp).unwrap();
        assert!(pages.contains(OFFSET - PAGE_FRAME_SIZE));

        // pusha writes up to 32 bytes below esp.
        let esp = OFFSET - PAGE_FRAME_SIZE;
        handle_user_fault(&pages, esp - 32, true, esp).unwrap();
        assert!(pages.contains(OFFSET - 2 * PAGE_FRAME_SIZE));
        assert_eq!(pages.len(), 2);
    }

    #[test]
    fn wild_accesses_do_not_grow_the_stack() {
        let pages = table();
        let esp = OFFSET - 64;
        assert_eq!(
            handle_user_fault(&pages, esp - 33, true, esp),
            Err(VmError::NotMapped)
        );
        let low = OFFSET - STACK_LIMIT - PAGE_FRAME_SIZE;
        assert_eq!(
            handle_user_fault(&pages, low, true, low),
            Err(VmError::NotMapped)
        );
        assert_eq!(
            handle_user_fault(&pages, OFFSET + 8, false, OFFSET),
            Err(VmError::NotMapped)
        );
        assert!(pages.is_empty());
    }
}
