//! The fixed-size pool of physical pages handed out to user mappings.

use super::PhysFrame;
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, vec::Vec};
use bitbybit::bitfield;
use core::{cell::UnsafeCell, ptr::NonNull};
use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;

/// Source of physical pages.
pub trait PagePool: Send + Sync {
    /// Take a free page, zeroing it if `zeroed` is set. Returns `None` when
    /// every page is in use.
    fn obtain(&self, zeroed: bool) -> Option<PhysFrame>;
    /// Return a page previously handed out by [`PagePool::obtain`].
    fn release(&self, frame: PhysFrame);
    /// Total number of pages in the pool.
    fn capacity(&self) -> usize;
    /// Number of pages currently handed out.
    fn in_use(&self) -> usize;
    /// Kernel pointer to the contents of `frame`.
    ///
    /// Dereferencing it is only sound for whoever currently owns the frame.
    fn page_ptr(&self, frame: PhysFrame) -> NonNull<[u8; PAGE_FRAME_SIZE]>;
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

struct CoreMap {
    entries: Box<[CoreMapEntry]>,
    /// The next frame index to start searching for a free frame.
    position: usize,
    allocated: usize,
}

#[repr(C, align(4096))]
struct PageBuf(UnsafeCell<[u8; PAGE_FRAME_SIZE]>);

/// A [`PagePool`] over a contiguous run of frames, allocated next-fit.
pub struct FramePool {
    /// Frame number of the first page in `memory`.
    first: u32,
    memory: Box<[PageBuf]>,
    core_map: Mutex<CoreMap>,
}

// SAFETY: Page contents are only reached through `page_ptr`, whose callers
// must own the frame. The core map is behind a lock.
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Create a pool of `frames` pages numbered from `first`.
    pub fn new(first: u32, frames: usize) -> Self {
        let memory: Vec<PageBuf> = (0..frames)
            .map(|_| PageBuf(UnsafeCell::new([0; PAGE_FRAME_SIZE])))
            .collect();
        Self {
            first,
            memory: memory.into_boxed_slice(),
            core_map: Mutex::new(CoreMap {
                entries: alloc::vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
                position: 0,
                allocated: 0,
            }),
        }
    }

    fn index_of(&self, frame: PhysFrame) -> usize {
        let index = frame
            .number()
            .checked_sub(self.first)
            .map(|index| index as usize)
            .filter(|index| *index < self.memory.len());
        match index {
            Some(index) => index,
            None => panic!("{frame} does not belong to this pool"),
        }
    }

    fn frame_at(&self, index: usize) -> PhysFrame {
        let offset = u32::try_from(index).unwrap_or(u32::MAX);
        PhysFrame::new(self.first + offset)
    }
}

impl PagePool for FramePool {
    fn obtain(&self, zeroed: bool) -> Option<PhysFrame> {
        let index = {
            let mut core_map = self.core_map.lock();
            let total = core_map.entries.len();
            if core_map.allocated == total {
                return None;
            }
            let start = core_map.position;
            let index = (0..total)
                .map(|step| (start + step) % total)
                .find(|&index| !core_map.entries[index].allocated())?;
            core_map.entries[index] = core_map.entries[index].with_allocated(true);
            core_map.position = (index + 1) % total;
            core_map.allocated += 1;
            index
        };

        if zeroed {
            // SAFETY: The frame was just marked allocated, so nobody else owns it.
            unsafe { (*self.memory[index].0.get()).fill(0) };
        }
        Some(self.frame_at(index))
    }

    fn release(&self, frame: PhysFrame) {
        let index = self.index_of(frame);
        let mut core_map = self.core_map.lock();
        assert!(
            core_map.entries[index].allocated(),
            "double release of {frame}"
        );
        core_map.entries[index] = core_map.entries[index].with_allocated(false);
        core_map.allocated -= 1;
    }

    fn capacity(&self) -> usize {
        self.memory.len()
    }

    fn in_use(&self) -> usize {
        self.core_map.lock().allocated
    }

    fn page_ptr(&self, frame: PhysFrame) -> NonNull<[u8; PAGE_FRAME_SIZE]> {
        let index = self.index_of(frame);
        // UnsafeCell::get never returns null.
        NonNull::new(self.memory[index].0.get()).unwrap_or(NonNull::dangling())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obtain_until_exhausted() {
        let pool = FramePool::new(256, 3);
        let frames: Vec<_> = (0..3).map(|_| pool.obtain(false).unwrap()).collect();
        assert_eq!(
            frames,
            [PhysFrame::new(256), PhysFrame::new(257), PhysFrame::new(258)]
        );
        assert_eq!(pool.obtain(false), None);
        assert_eq!(pool.in_use(), 3);

        pool.release(frames[1]);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.obtain(false), Some(PhysFrame::new(257)));
    }

    #[test]
    fn next_fit_continues_after_last_allocation() {
        let pool = FramePool::new(0, 4);
        let a = pool.obtain(false).unwrap();
        let _b = pool.obtain(false).unwrap();
        pool.release(a);
        // Frame 0 is free again, but the search resumes at frame 2.
        assert_eq!(pool.obtain(false), Some(PhysFrame::new(2)));
        assert_eq!(pool.obtain(false), Some(PhysFrame::new(3)));
        assert_eq!(pool.obtain(false), Some(PhysFrame::new(0)));
    }

    #[test]
    fn zeroed_pages_are_cleared() {
        let pool = FramePool::new(0, 1);
        let frame = pool.obtain(false).unwrap();
        unsafe { (*pool.page_ptr(frame).as_ptr()).fill(0xFF) };
        pool.release(frame);

        let frame = pool.obtain(false).unwrap();
        assert!(unsafe { (*pool.page_ptr(frame).as_ptr()).iter().all(|&b| b == 0xFF) });
        pool.release(frame);

        let frame = pool.obtain(true).unwrap();
        assert!(unsafe { (*pool.page_ptr(frame).as_ptr()).iter().all(|&b| b == 0) });
    }
}
