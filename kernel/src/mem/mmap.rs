//! Memory-mapped files.

use super::{
    frame_table::Disposal,
    page_table::{Backing, PageKind, SupplementalPageTable},
    Result,
};
use crate::vfs::FileRef;
use alloc::{collections::BTreeMap, vec::Vec};
use core::fmt;
use kidneyos_vm_shared::mem::{is_page_aligned, pages_spanning, OFFSET, PAGE_FRAME_SIZE};

/// Returned to user programs in place of a mapping id when `mmap` fails.
pub const MAP_FAILED: i32 = -1;

/// Identifies a mapping within its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(u32);

impl MapId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mapping {}", self.0)
    }
}

struct Mapping {
    /// Private handle, closed when the mapping goes away.
    file: FileRef,
    /// Pages in ascending order.
    pages: Vec<usize>,
}

/// The file mappings of one process.
#[derive(Default)]
pub struct MmapTable {
    next_id: u32,
    mappings: BTreeMap<MapId, Mapping>,
}

impl MmapTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map the whole of `file` at `addr`, one lazily loaded page at a time.
    ///
    /// Returns `None`, changing nothing, if `addr` is null or not page-aligned,
    /// if the file is empty, or if any page of the range is already in use or
    /// outside user memory.
    pub fn map(
        &mut self,
        pages: &SupplementalPageTable,
        file: &FileRef,
        addr: usize,
    ) -> Option<MapId> {
        if addr == 0 || !is_page_aligned(addr) {
            return None;
        }
        // Ids are handed to user programs as non-negative `i32`s.
        if i32::try_from(self.next_id).is_err() {
            log::warn!("mmap at {addr:#X}: out of mapping ids");
            return None;
        }
        let len = usize::try_from(file.len()).ok().filter(|len| *len > 0)?;
        let count = pages_spanning(len);
        let end = addr.checked_add(count * PAGE_FRAME_SIZE)?;
        if end > OFFSET {
            return None;
        }
        let vpns: Vec<usize> = (0..count).map(|i| addr + i * PAGE_FRAME_SIZE).collect();
        if vpns.iter().any(|vpn| pages.contains(*vpn)) {
            return None;
        }
        let file = file.reopen().ok()?;

        for (i, vpn) in vpns.iter().enumerate() {
            let offset = i * PAGE_FRAME_SIZE;
            let backing = Backing::File {
                file: file.clone(),
                offset: offset as u64,
                valid_bytes: (len - offset).min(PAGE_FRAME_SIZE),
            };
            let inserted = pages
                .create(*vpn, PageKind::MemoryMapped, true, backing)
                .and_then(|entry| pages.insert(entry));
            if let Err(err) = inserted {
                // Lost a race with another thread of the process.
                log::debug!("mmap at {addr:#X} failed: {err}");
                for vpn in &vpns[..i] {
                    let _ = pages.delete(*vpn);
                }
                return None;
            }
        }

        let id = MapId(self.next_id);
        self.next_id += 1;
        log::debug!("{id}: {len} bytes at {addr:#X} in {count} pages");
        self.mappings.insert(id, Mapping { file, pages: vpns });
        Some(id)
    }

    /// Write back the dirty pages of mapping `id` and remove it. Unknown ids
    /// are ignored.
    ///
    /// The mapping is always torn down. A failed write-back is reported after
    /// the fact.
    pub fn unmap(&mut self, pages: &SupplementalPageTable, id: MapId) -> Result<()> {
        let Some(mapping) = self.mappings.remove(&id) else {
            return Ok(());
        };
        let mut result = Ok(());
        for vpn in &mapping.pages {
            let flushed = pages.delete_with(*vpn, Disposal::Flush);
            if result.is_ok() {
                result = flushed;
            }
        }
        log::debug!("{id}: unmapped {} pages", mapping.pages.len());
        drop(mapping.file);
        result
    }

    /// Unmap everything, as on process exit.
    pub fn unmap_all(&mut self, pages: &SupplementalPageTable) -> Result<()> {
        let ids: Vec<MapId> = self.mappings.keys().copied().collect();
        let mut result = Ok(());
        for id in ids {
            let unmapped = self.unmap(pages, id);
            if result.is_ok() {
                result = unmapped;
            }
        }
        result
    }

    /// The pages of mapping `id`.
    pub fn pages(&self, id: MapId) -> Option<&[usize]> {
        self.mappings.get(&id).map(|mapping| mapping.pages.as_slice())
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{
        fault::handle_fault,
        frame_table::{tests::vm_with, FrameTable},
        page_table::Location,
        swapping::SwapSpace,
        VmError,
    };
    use crate::paging::PageMap;
    use crate::vfs::{tempfs::TempFile, File};
    use alloc::{sync::Arc, vec};

    const PAGE: usize = PAGE_FRAME_SIZE;
    const ADDR: usize = 0x1000_0000;

    fn setup(frames: usize) -> (SupplementalPageTable, Arc<FrameTable>, Arc<SwapSpace>) {
        let (table, _, swap) = vm_with(frames, 4);
        let pages = SupplementalPageTable::new(Arc::new(PageMap::new(1)), table.clone());
        (pages, table, swap)
    }

    fn write_user(pages: &SupplementalPageTable, vaddr: usize, bytes: &[u8]) {
        handle_fault(pages, vaddr, true).unwrap();
        pages
            .frames()
            .access(&**pages.space(), vaddr, true, |page| {
                let start = vaddr % PAGE;
                page[start..start + bytes.len()].copy_from_slice(bytes);
            })
            .unwrap();
    }

    #[test]
    fn one_entry_per_page_with_a_partial_tail() {
        let (pages, _, _) = setup(2);
        let mut mmaps = MmapTable::new();
        let file: FileRef = TempFile::zeroed(2 * PAGE + 100);
        let id = mmaps.map(&pages, &file, ADDR).unwrap();

        assert_eq!(mmaps.pages(id), Some(&[ADDR, ADDR + PAGE, ADDR + 2 * PAGE][..]));
        assert_eq!(pages.len(), 3);
        for vpn in [ADDR, ADDR + PAGE, ADDR + 2 * PAGE] {
            let entry = pages.lookup(vpn).unwrap();
            assert_eq!(entry.kind(), PageKind::MemoryMapped);
            assert_eq!(entry.location(), Location::Unloaded);
        }
        assert_eq!(pages.lookup(ADDR).unwrap().valid_bytes(), PAGE);
        assert_eq!(pages.lookup(ADDR + 2 * PAGE).unwrap().valid_bytes(), 100);

        let exact: FileRef = TempFile::zeroed(2 * PAGE);
        let id = mmaps.map(&pages, &exact, ADDR + 8 * PAGE).unwrap();
        assert_eq!(mmaps.pages(id).map(<[usize]>::len), Some(2));
        assert_eq!(pages.lookup(ADDR + 9 * PAGE).unwrap().valid_bytes(), PAGE);
    }

    #[test]
    fn invalid_requests_change_nothing() {
        let (pages, _, _) = setup(2);
        let mut mmaps = MmapTable::new();
        let file: FileRef = TempFile::zeroed(2 * PAGE);
        let empty: FileRef = TempFile::zeroed(0);

        let existing = pages
            .create(ADDR + PAGE, PageKind::SwapBacked, true, Backing::Anonymous)
            .unwrap();
        pages.insert(existing).unwrap();

        assert_eq!(mmaps.map(&pages, &file, 0), None);
        assert_eq!(mmaps.map(&pages, &file, ADDR + 12), None);
        assert_eq!(mmaps.map(&pages, &empty, ADDR + 4 * PAGE), None);
        // Overlaps the existing page with its second page.
        assert_eq!(mmaps.map(&pages, &file, ADDR), None);
        assert_eq!(mmaps.map(&pages, &file, OFFSET - PAGE), None);
        assert_eq!(mmaps.map(&pages, &file, OFFSET), None);

        assert!(mmaps.is_empty());
        assert_eq!(pages.len(), 1);
    }

    #[test]
    fn removed_files_cannot_be_mapped() {
        let (pages, _, _) = setup(2);
        let mut mmaps = MmapTable::new();
        let file = TempFile::with_contents(b"data");
        file.remove();
        let file: FileRef = file;
        assert_eq!(mmaps.map(&pages, &file, ADDR), None);
        assert!(pages.is_empty());
    }

    #[test]
    fn ids_count_up_and_are_not_reused() {
        let (pages, _, _) = setup(2);
        let mut mmaps = MmapTable::new();
        let file: FileRef = TempFile::zeroed(10);
        let a = mmaps.map(&pages, &file, ADDR).unwrap();
        let b = mmaps.map(&pages, &file, ADDR + PAGE).unwrap();
        assert_eq!((a.get(), b.get()), (0, 1));

        mmaps.unmap(&pages, a).unwrap();
        let c = mmaps.map(&pages, &file, ADDR).unwrap();
        assert_eq!(c.get(), 2);

        // Unknown ids are ignored.
        mmaps.unmap(&pages, a).unwrap();
        mmaps.unmap(&pages, MapId::new(99)).unwrap();
        assert_eq!(mmaps.len(), 2);
    }

    #[test]
    fn running_out_of_ids_maps_nothing() {
        let (pages, _, _) = setup(2);
        let mut mmaps = MmapTable::new();
        let file: FileRef = TempFile::zeroed(10);

        mmaps.next_id = i32::MAX as u32;
        let last = mmaps.map(&pages, &file, ADDR).unwrap();
        assert_eq!(i32::try_from(last.get()), Ok(i32::MAX));

        assert_eq!(mmaps.map(&pages, &file, ADDR + PAGE), None);
        assert!(!pages.contains(ADDR + PAGE));
        assert_eq!((pages.len(), mmaps.len()), (1, 1));
    }

    #[test]
    fn unmap_writes_back_modified_pages() {
        let (pages, frames, _) = setup(2);
        let mut mmaps = MmapTable::new();
        let mut contents = vec![0; PAGE];
        contents[..4].copy_from_slice(b"ABCD");
        let file = TempFile::with_contents(&contents);
        let id = mmaps.map(&pages, &(file.clone() as FileRef), ADDR).unwrap();

        write_user(&pages, ADDR, b"WXYZ");
        mmaps.unmap(&pages, id).unwrap();
        assert!(pages.is_empty());
        assert_eq!(frames.resident(), 0);
        assert_eq!(pages.space().translate(ADDR, false), None);

        let reopened = file.reopen().unwrap();
        let mut buf = [0; 4];
        assert_eq!(reopened.read_at(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"WXYZ");
    }

    #[test]
    fn clean_pages_are_not_written() {
        let (pages, _, _) = setup(2);
        let mut mmaps = MmapTable::new();
        let file = TempFile::with_contents(b"ABCD");
        let id = mmaps.map(&pages, &(file.clone() as FileRef), ADDR).unwrap();

        handle_fault(&pages, ADDR, false).unwrap();
        file.write_at(b"1234", 0).unwrap();
        mmaps.unmap(&pages, id).unwrap();
        assert_eq!(file.contents(), b"1234");
    }

    #[test]
    fn evicted_pages_reload_from_the_file() {
        let (pages, frames, swap) = setup(1);
        let mut mmaps = MmapTable::new();
        let file = TempFile::with_contents(&[b'm'; 2 * PAGE]);
        let id = mmaps.map(&pages, &(file.clone() as FileRef), ADDR).unwrap();

        write_user(&pages, ADDR + 1, b"!");
        write_user(&pages, ADDR + PAGE, b"?");
        // The first page was written back to make room for the second.
        assert_eq!(file.contents()[..2], *b"m!");
        assert_eq!(swap.used(), 0);
        assert_eq!(frames.evictions(), 1);

        let byte = handle_fault(&pages, ADDR, false)
            .and_then(|_| {
                frames
                    .access(&**pages.space(), ADDR + 1, false, |page| page[1])
                    .ok_or(VmError::NotMapped)
            })
            .unwrap();
        assert_eq!(byte, b'!');

        mmaps.unmap(&pages, id).unwrap();
        assert_eq!(file.contents()[PAGE], b'?');
    }

    #[test]
    fn unmap_all_closes_every_mapping() {
        let (pages, frames, _) = setup(4);
        let mut mmaps = MmapTable::new();
        let file = TempFile::with_contents(&[0; 3 * PAGE]);
        let as_ref: FileRef = file.clone();
        mmaps.map(&pages, &as_ref, ADDR).unwrap();
        mmaps.map(&pages, &as_ref, ADDR + 4 * PAGE).unwrap();
        write_user(&pages, ADDR + 4 * PAGE + 2 * PAGE, b"end");

        mmaps.unmap_all(&pages).unwrap();
        assert!(mmaps.is_empty());
        assert!(pages.is_empty());
        assert_eq!(frames.resident(), 0);
        assert_eq!(&file.contents()[2 * PAGE..2 * PAGE + 3], b"end");
    }
}
