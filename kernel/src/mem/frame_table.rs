//! The registry of physical frames backing user pages, shared by every
//! address space.
//!
//! All allocation and eviction happens under the one frame table lock,
//! including the swap and file I/O an eviction performs. That serializes
//! faults system-wide while a page is being written out, but keeps every
//! frame's owner, mapping and contents consistent without per-frame pinning.

use super::{
    frame_pool::PagePool,
    page_replacement::{Clock, PageReplacementPolicy},
    page_table::{Backing, Location, PageEntry, PageKind, PageState},
    swapping::SwapSpace,
    PhysFrame, Result, VmError,
};
use crate::paging::{AddressSpace, SpaceId};
use crate::sync::mutex::Mutex;
use alloc::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use kidneyos_vm_shared::mem::{page_round_down, PAGE_FRAME_SIZE};

/// A resident user page.
pub struct Frame {
    space: Arc<dyn AddressSpace>,
    vpn: usize,
    entry: Weak<PageEntry>,
}

impl Frame {
    pub(super) fn new(space: Arc<dyn AddressSpace>, vpn: usize, entry: Weak<PageEntry>) -> Self {
        Self { space, vpn, entry }
    }

    /// Whether the page was accessed since the bit was last cleared.
    pub fn is_referenced(&self) -> bool {
        self.space.is_accessed(self.vpn)
    }

    pub fn clear_referenced(&self) {
        self.space.set_accessed(self.vpn, false);
    }
}

/// Public view of a [`Frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame: PhysFrame,
    pub owner: SpaceId,
    pub vpn: usize,
}

/// What to do with a resident page's contents when its frame is taken away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// Keep the contents reachable: write mapped pages back, move anonymous
    /// data to swap.
    Evict,
    /// Write a dirty mapped page back to its file and drop it.
    Flush,
    /// Drop the contents.
    Discard,
}

struct FrameTableInner<P> {
    frames: BTreeMap<PhysFrame, Frame>,
    policy: P,
    evictions: usize,
}

pub struct FrameTable<P = Clock> {
    pool: Arc<dyn PagePool>,
    swap: Arc<SwapSpace>,
    inner: Mutex<FrameTableInner<P>>,
}

impl<P: PageReplacementPolicy> FrameTable<P> {
    pub fn new(pool: Arc<dyn PagePool>, swap: Arc<SwapSpace>) -> Self {
        Self {
            pool,
            swap,
            inner: Mutex::new(FrameTableInner {
                frames: BTreeMap::new(),
                policy: P::default(),
                evictions: 0,
            }),
        }
    }

    pub fn swap(&self) -> &Arc<SwapSpace> {
        &self.swap
    }

    #[allow(clippy::mut_from_ref)]
    fn page(&self, frame: PhysFrame) -> &mut [u8; PAGE_FRAME_SIZE] {
        // SAFETY: Frames in use belong to this table, and their contents are
        // only touched while the table lock is held.
        unsafe { &mut *self.pool.page_ptr(frame).as_ptr() }
    }

    /// Make `entry` resident in `space`, returning the frame backing it.
    ///
    /// Takes a frame from the pool, evicting as many pages as needed to get
    /// one, fills it from swap, the backing file, or zeros, and installs the
    /// mapping.
    pub fn load(&self, space: &Arc<dyn AddressSpace>, entry: &Arc<PageEntry>) -> Result<PhysFrame> {
        let mut inner = self.inner.lock();
        match entry.location() {
            Location::Freed => return Err(VmError::Freed),
            Location::Resident(frame) => return Ok(frame),
            Location::Unloaded | Location::Swapped(_) => {}
        }

        let zeroed = {
            let state = entry.state();
            matches!(
                (&state.location, &state.backing),
                (Location::Unloaded, Backing::Anonymous)
            )
        };
        let frame = self.allocate(&mut inner, zeroed)?;
        let mut state = entry.state();
        if let Err(err) = self.fill(&mut state, self.page(frame)) {
            log::warn!("failed to load page {:#X}: {}", entry.vpn(), err);
            self.pool.release(frame);
            return Err(err);
        }

        space.install(entry.vpn(), frame, entry.writable());
        state.location = Location::Resident(frame);
        inner.frames.insert(
            frame,
            Frame::new(space.clone(), entry.vpn(), Arc::downgrade(entry)),
        );
        log::trace!(
            "page {:#X} of space {} now in {}",
            entry.vpn(),
            space.id(),
            frame
        );
        Ok(frame)
    }

    /// Take a page from the pool, evicting until one is free.
    fn allocate(&self, inner: &mut FrameTableInner<P>, zeroed: bool) -> Result<PhysFrame> {
        loop {
            if let Some(frame) = self.pool.obtain(zeroed) {
                return Ok(frame);
            }
            self.evict_one(inner)?;
        }
    }

    fn fill(&self, state: &mut PageState, page: &mut [u8; PAGE_FRAME_SIZE]) -> Result<()> {
        if let Location::Swapped(slot) = state.location {
            self.swap.swap_in(slot, page)?;
            state.location = Location::Unloaded;
            return Ok(());
        }
        match &state.backing {
            // Came zeroed from the pool.
            Backing::Anonymous => {}
            Backing::File {
                file,
                offset,
                valid_bytes,
            } => {
                let read = file.read_at(&mut page[..*valid_bytes], *offset)?;
                if read != *valid_bytes {
                    return Err(VmError::ShortRead);
                }
                page[*valid_bytes..].fill(0);
            }
        }
        Ok(())
    }

    /// Write a mapped page back to its file if it was modified.
    fn write_back(state: &PageState, page: &[u8; PAGE_FRAME_SIZE], dirty: bool) -> Result<()> {
        let (PageKind::MemoryMapped, true) = (state.kind, dirty) else {
            return Ok(());
        };
        let Backing::File {
            file,
            offset,
            valid_bytes,
        } = &state.backing
        else {
            return Ok(());
        };
        let written = file.write_at(&page[..*valid_bytes], *offset)?;
        if written != *valid_bytes {
            log::error!(
                "short write-back at offset {}: {} of {} bytes",
                offset,
                written,
                valid_bytes
            );
            return Err(VmError::ShortWrite);
        }
        Ok(())
    }

    /// Save the contents of an evicted page, returning where they went.
    fn save(
        &self,
        state: &mut PageState,
        page: &[u8; PAGE_FRAME_SIZE],
        dirty: bool,
    ) -> Result<Location> {
        match (state.kind, dirty) {
            (PageKind::MemoryMapped, _) => {
                Self::write_back(state, page, dirty)?;
                Ok(Location::Unloaded)
            }
            (PageKind::SwapBacked, _) => Ok(Location::Swapped(self.swap.swap_out(page)?)),
            (PageKind::FileBacked, true) => {
                let slot = self.swap.swap_out(page)?;
                state.kind = PageKind::SwapBacked;
                Ok(Location::Swapped(slot))
            }
            (PageKind::FileBacked, false) => Ok(Location::Unloaded),
        }
    }

    /// Take `frame` away from the page described by `state`.
    ///
    /// On an eviction that fails to save the contents the page stays
    /// resident. Otherwise the mapping is cleared, the frame released and
    /// unregistered, even if a flush fails.
    fn dispose(
        &self,
        inner: &mut FrameTableInner<P>,
        frame: PhysFrame,
        state: &mut PageState,
        disposal: Disposal,
    ) -> Result<()> {
        let Some(record) = inner.frames.get(&frame) else {
            panic!("{frame} is not registered");
        };
        let space = record.space.clone();
        let vpn = record.vpn;
        let dirty = space.is_dirty(vpn);
        let page = self.page(frame);

        let (location, result) = match disposal {
            Disposal::Evict => (self.save(state, page, dirty)?, Ok(())),
            Disposal::Flush => (Location::Unloaded, Self::write_back(state, page, dirty)),
            Disposal::Discard => (Location::Unloaded, Ok(())),
        };

        space.clear(vpn);
        inner.frames.remove(&frame);
        self.pool.release(frame);
        state.location = location;
        result
    }

    fn evict_one(&self, inner: &mut FrameTableInner<P>) -> Result<PhysFrame> {
        let victim = inner
            .policy
            .select_victim(&inner.frames)
            .ok_or(VmError::OutOfFrames)?;
        self.evict_frame(inner, victim)?;
        inner.evictions += 1;
        Ok(victim)
    }

    fn evict_frame(&self, inner: &mut FrameTableInner<P>, frame: PhysFrame) -> Result<()> {
        let Some(record) = inner.frames.get(&frame) else {
            return Err(VmError::NotMapped);
        };
        let Some(entry) = record.entry.upgrade() else {
            // The entry is gone, so nobody can fault the page back in.
            record.space.clear(record.vpn);
            inner.frames.remove(&frame);
            self.pool.release(frame);
            return Ok(());
        };

        let mut state = entry.state();
        self.dispose(inner, frame, &mut state, Disposal::Evict)?;
        log::debug!(
            "evicted page {:#X} from {} ({:?})",
            entry.vpn(),
            frame,
            state.location
        );
        Ok(())
    }

    /// Run the replacement policy once and evict its victim.
    ///
    /// Returns `None` if no frame is in use.
    pub fn evict(&self) -> Result<Option<PhysFrame>> {
        let mut inner = self.inner.lock();
        match self.evict_one(&mut inner) {
            Ok(frame) => Ok(Some(frame)),
            Err(VmError::OutOfFrames) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Evict whatever page `frame` holds, keeping its contents reachable.
    pub fn free(&self, frame: PhysFrame) -> Result<()> {
        let mut inner = self.inner.lock();
        self.evict_frame(&mut inner, frame)
    }

    pub fn find(&self, frame: PhysFrame) -> Option<FrameInfo> {
        let inner = self.inner.lock();
        inner.frames.get(&frame).map(|record| FrameInfo {
            frame,
            owner: record.space.id(),
            vpn: record.vpn,
        })
    }

    /// Drop `entry`'s frame or swap slot and mark it freed.
    pub(super) fn retire(&self, entry: &PageEntry, disposal: Disposal) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut state = entry.state();
        let result = match state.location {
            Location::Resident(frame) => self.dispose(&mut inner, frame, &mut state, disposal),
            Location::Swapped(slot) => self.swap.swap_free(slot),
            Location::Unloaded | Location::Freed => Ok(()),
        };
        state.location = Location::Freed;
        result
    }

    /// Perform a user access to `vaddr` in `space`, handing `f` the page if it
    /// is resident and the access is permitted.
    ///
    /// The page cannot be evicted while `f` runs.
    pub fn access<R>(
        &self,
        space: &dyn AddressSpace,
        vaddr: usize,
        write: bool,
        f: impl FnOnce(&mut [u8; PAGE_FRAME_SIZE]) -> R,
    ) -> Option<R> {
        let _inner = self.inner.lock();
        let frame = space.translate(page_round_down(vaddr), write)?;
        Some(f(self.page(frame)))
    }

    /// Number of frames backing user pages.
    pub fn resident(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn evictions(&self) -> usize {
        self.inner.lock().evictions
    }
}
