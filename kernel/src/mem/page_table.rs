//! Per-process supplemental page table.
//!
//! Records, for every user page the process may touch, where its contents
//! live while it is not resident and how to get rid of it when it is evicted.

use super::{
    frame_table::{Disposal, FrameTable},
    swapping::SwapSlot,
    PhysFrame, Result, VmError,
};
use crate::paging::AddressSpace;
use crate::sync::mutex::{Mutex, MutexGuard};
use crate::vfs::FileRef;
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;
use kidneyos_vm_shared::mem::{is_page_aligned, is_user_vaddr, page_round_down, PAGE_FRAME_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Loaded from a file (or zero-filled) and never written back to it.
    /// Becomes [`PageKind::SwapBacked`] the first time it is evicted dirty.
    FileBacked,
    /// Lives in swap while not resident.
    SwapBacked,
    /// Part of an mmap region; dirty contents go back to the file.
    MemoryMapped,
}

/// Where a non-resident page's original contents come from.
#[derive(Clone)]
pub enum Backing {
    /// Zero-filled on first load.
    Anonymous,
    /// The first `valid_bytes` of the page are `file` at `offset`; the rest
    /// of the page is zero.
    File {
        file: FileRef,
        offset: u64,
        valid_bytes: usize,
    },
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Anonymous => write!(f, "Anonymous"),
            Backing::File {
                offset,
                valid_bytes,
                ..
            } => write!(f, "File {{ offset: {offset}, valid_bytes: {valid_bytes} }}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Not loaded yet, or dropped clean. Reload from the backing.
    Unloaded,
    Resident(PhysFrame),
    Swapped(SwapSlot),
    /// Deleted. The entry only survives through stray references.
    Freed,
}

#[derive(Debug)]
pub struct PageState {
    pub kind: PageKind,
    pub backing: Backing,
    pub location: Location,
}

/// Metadata for one virtual page.
#[derive(Debug)]
pub struct PageEntry {
    vpn: usize,
    writable: bool,
    state: Mutex<PageState>,
}

impl PageEntry {
    pub fn vpn(&self) -> usize {
        self.vpn
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn kind(&self) -> PageKind {
        self.state.lock().kind
    }

    pub fn location(&self) -> Location {
        self.state.lock().location
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.location(), Location::Resident(_))
    }

    /// Bytes of the page that come from a file, or 0 for anonymous pages.
    pub fn valid_bytes(&self) -> usize {
        match self.state.lock().backing {
            Backing::Anonymous => 0,
            Backing::File { valid_bytes, .. } => valid_bytes,
        }
    }

    /// Must not be held while taking the frame table lock.
    pub(super) fn state(&self) -> MutexGuard<'_, PageState> {
        self.state.lock()
    }
}

/// The pages known to one address space, keyed by page address.
pub struct SupplementalPageTable {
    space: Arc<dyn AddressSpace>,
    frames: Arc<FrameTable>,
    entries: Mutex<BTreeMap<usize, Arc<PageEntry>>>,
}

impl SupplementalPageTable {
    pub fn new(space: Arc<dyn AddressSpace>, frames: Arc<FrameTable>) -> Self {
        Self {
            space,
            frames,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    /// Build a non-resident entry for page `vpn`. The entry is not part of
    /// the table until [`SupplementalPageTable::insert`]ed.
    pub fn create(
        &self,
        vpn: usize,
        kind: PageKind,
        writable: bool,
        backing: Backing,
    ) -> Result<Arc<PageEntry>> {
        if vpn == 0 || !is_page_aligned(vpn) || !is_user_vaddr(vpn) {
            return Err(VmError::BadAddress);
        }
        if let Backing::File { valid_bytes, .. } = &backing {
            let valid_bytes = *valid_bytes;
            assert!(
                valid_bytes <= PAGE_FRAME_SIZE,
                "{valid_bytes} valid bytes do not fit in a page"
            );
        } else {
            assert!(
                kind != PageKind::MemoryMapped,
                "memory-mapped page {vpn:#X} needs a file"
            );
        }
        Ok(Arc::new(PageEntry {
            vpn,
            writable,
            state: Mutex::new(PageState {
                kind,
                backing,
                location: Location::Unloaded,
            }),
        }))
    }

    pub fn insert(&self, entry: Arc<PageEntry>) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&entry.vpn) {
            return Err(VmError::AlreadyMapped);
        }
        entries.insert(entry.vpn, entry);
        Ok(())
    }

    /// The entry covering `vaddr`, which need not be page-aligned.
    pub fn lookup(&self, vaddr: usize) -> Option<Arc<PageEntry>> {
        self.entries.lock().get(&page_round_down(vaddr)).cloned()
    }

    pub fn contains(&self, vaddr: usize) -> bool {
        self.entries.lock().contains_key(&page_round_down(vaddr))
    }

    /// Remove page `vpn`, dropping its frame or swap slot.
    pub fn delete(&self, vpn: usize) -> Result<()> {
        self.delete_with(vpn, Disposal::Discard)
    }

    pub(super) fn delete_with(&self, vpn: usize, disposal: Disposal) -> Result<()> {
        let entry = self.entries.lock().remove(&vpn).ok_or(VmError::NotMapped)?;
        self.frames.retire(&entry, disposal)
    }

    /// Delete every entry.
    pub fn destroy(&self) {
        let entries = core::mem::take(&mut *self.entries.lock());
        if !entries.is_empty() {
            log::debug!(
                "releasing {} pages of address space {}",
                entries.len(),
                self.space.id()
            );
        }
        for entry in entries.into_values() {
            if let Err(err) = self.frames.retire(&entry, Disposal::Discard) {
                log::error!("releasing page {:#X}: {}", entry.vpn(), err);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Page addresses in the table, in ascending order.
    pub fn pages(&self) -> Vec<usize> {
        self.entries.lock().keys().copied().collect()
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        self.destroy();
    }
}
