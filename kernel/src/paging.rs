//! Virtual to physical mappings of one address space.

use crate::mem::PhysFrame;
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, collections::BTreeMap};
use kidneyos_vm_shared::{
    mem::{is_user_vaddr, page_round_down},
    paging::{PageTable, PageTableEntry, VirtualAddress},
};

/// Identity of an address space (the owning process id).
pub type SpaceId = u32;

/// The hardware mapping primitive for one address space.
///
/// All methods take page addresses; offsets within the page are ignored.
pub trait AddressSpace: Send + Sync {
    fn id(&self) -> SpaceId;
    /// Map user page `vaddr` to `frame`.
    fn install(&self, vaddr: usize, frame: PhysFrame, writable: bool);
    /// Remove the mapping for `vaddr`, if any.
    fn clear(&self, vaddr: usize);
    /// Perform an access to `vaddr` the way the MMU would: fails if the page is
    /// not present, or if `write` is set and the page is read-only. Otherwise
    /// sets the accessed bit, and the dirty bit for writes.
    fn translate(&self, vaddr: usize, write: bool) -> Option<PhysFrame>;
    fn is_accessed(&self, vaddr: usize) -> bool;
    fn set_accessed(&self, vaddr: usize, accessed: bool);
    fn is_dirty(&self, vaddr: usize) -> bool;
}

/// Two-level x86 page tables for the user half of an address space.
///
/// Page tables are allocated as their first entry is installed and freed when
/// their last entry is cleared.
pub struct PageMap {
    id: SpaceId,
    tables: Mutex<BTreeMap<usize, Box<PageTable>>>,
}

impl PageMap {
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_entry<R>(&self, vaddr: usize, f: impl FnOnce(&mut PageTableEntry) -> R) -> Option<R> {
        let addr = VirtualAddress::from_usize(page_round_down(vaddr));
        let mut tables = self.tables.lock();
        let table = tables.get_mut(&addr.directory_index())?;
        let entry = &mut table[addr.table_index()];
        if !entry.present() {
            return None;
        }
        Some(f(entry))
    }

    /// Number of present mappings.
    pub fn mapped(&self) -> usize {
        self.tables
            .lock()
            .values()
            .map(|table| table.iter().filter(|entry| entry.present()).count())
            .sum()
    }
}

impl AddressSpace for PageMap {
    fn id(&self) -> SpaceId {
        self.id
    }

    fn install(&self, vaddr: usize, frame: PhysFrame, writable: bool) {
        assert!(is_user_vaddr(vaddr), "mapping kernel address {vaddr:#X}");
        let addr = VirtualAddress::from_usize(page_round_down(vaddr));
        let mut tables = self.tables.lock();
        let table = tables.entry(addr.directory_index()).or_default();
        table[addr.table_index()] = PageTableEntry::user_mapping(frame.number(), writable);
    }

    fn clear(&self, vaddr: usize) {
        let addr = VirtualAddress::from_usize(page_round_down(vaddr));
        let mut tables = self.tables.lock();
        let Some(table) = tables.get_mut(&addr.directory_index()) else {
            return;
        };
        table[addr.table_index()] = PageTableEntry::DEFAULT;
        if table.is_empty() {
            tables.remove(&addr.directory_index());
        }
    }

    fn translate(&self, vaddr: usize, write: bool) -> Option<PhysFrame> {
        self.with_entry(vaddr, |entry| {
            if write && !entry.read_write() {
                return None;
            }
            *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
            Some(PhysFrame::new(entry.frame_number()))
        })
        .flatten()
    }

    fn is_accessed(&self, vaddr: usize) -> bool {
        self.with_entry(vaddr, |entry| entry.accessed()).unwrap_or(false)
    }

    fn set_accessed(&self, vaddr: usize, accessed: bool) {
        self.with_entry(vaddr, |entry| *entry = entry.with_accessed(accessed));
    }

    fn is_dirty(&self, vaddr: usize) -> bool {
        self.with_entry(vaddr, |entry| entry.dirty()).unwrap_or(false)
    }
}
