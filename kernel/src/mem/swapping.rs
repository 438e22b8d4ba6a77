//! Page-sized swap slots on a block device.

use super::{Result, VmError};
use crate::block::block_core::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::mutex::Mutex;
use alloc::{vec, vec::Vec};
use core::{fmt, num::NonZeroU32};
use kidneyos_vm_shared::{mem::PAGE_FRAME_SIZE, sizes::SECTORS_PER_PAGE};

/// Handle to an allocated swap slot.
///
/// Handles are 1-based so that no valid handle is ever zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(NonZeroU32);

impl SwapSlot {
    fn from_index(index: usize) -> Self {
        let raw = u32::try_from(index + 1)
            .ok()
            .and_then(NonZeroU32::new)
            .unwrap_or(NonZeroU32::MAX);
        Self(raw)
    }

    /// 0-based position of the slot on the device.
    pub fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "swap slot {}", self.0)
    }
}

struct SwapInner {
    block: Block,
    /// One bit per slot, set while the slot holds a page.
    bitmap: Vec<u64>,
    slots: usize,
    used: usize,
}

impl SwapInner {
    fn is_set(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize, value: bool) {
        let bit = 1 << (index % 64);
        if value {
            self.bitmap[index / 64] |= bit;
        } else {
            self.bitmap[index / 64] &= !bit;
        }
    }

    fn first_free(&self) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * 64 + word.trailing_ones() as usize)
            .filter(|index| *index < self.slots)
    }

    fn valid(&self, slot: SwapSlot) -> Result<usize> {
        let index = slot.index();
        if index >= self.slots || !self.is_set(index) {
            return Err(VmError::InvalidSwapSlot);
        }
        Ok(index)
    }

    fn first_sector(index: usize) -> BlockSector {
        // Fits: the slot count was derived from a BlockSector size.
        index as BlockSector * SECTORS_PER_PAGE
    }
}

/// Swap space backed by a block device, allocated a page at a time.
pub struct SwapSpace {
    inner: Mutex<SwapInner>,
}

impl SwapSpace {
    /// Use all of `block` as swap. A trailing partial page is left unused.
    pub fn new(block: Block) -> Self {
        let slots = (block.get_size() / SECTORS_PER_PAGE) as usize;
        log::debug!("{} provides {} swap slots", block, slots);
        Self {
            inner: Mutex::new(SwapInner {
                block,
                bitmap: vec![0; slots.div_ceil(64)],
                slots,
                used: 0,
            }),
        }
    }

    /// Write `page` to the first free slot and return its handle.
    pub fn swap_out(&self, page: &[u8; PAGE_FRAME_SIZE]) -> Result<SwapSlot> {
        let mut inner = self.inner.lock();
        let Some(index) = inner.first_free() else {
            log::warn!("swap space exhausted ({} slots)", inner.slots);
            return Err(VmError::SwapFull);
        };

        let start = SwapInner::first_sector(index);
        for (sector, chunk) in (start..).zip(page.chunks_exact(BLOCK_SECTOR_SIZE)) {
            inner.block.write(sector, chunk)?;
        }
        inner.set(index, true);
        inner.used += 1;

        let slot = SwapSlot::from_index(index);
        log::trace!("wrote page to {slot}");
        Ok(slot)
    }

    /// Read `slot` back into `page` and release it.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8; PAGE_FRAME_SIZE]) -> Result<()> {
        let mut inner = self.inner.lock();
        let index = inner.valid(slot)?;

        let start = SwapInner::first_sector(index);
        for (sector, chunk) in (start..).zip(page.chunks_exact_mut(BLOCK_SECTOR_SIZE)) {
            inner.block.read(sector, chunk)?;
        }
        inner.set(index, false);
        inner.used -= 1;

        log::trace!("read page from {slot}");
        Ok(())
    }

    /// Release `slot` without reading it.
    pub fn swap_free(&self, slot: SwapSlot) -> Result<()> {
        let mut inner = self.inner.lock();
        let index = inner.valid(slot)?;
        inner.set(index, false);
        inner.used -= 1;
        Ok(())
    }

    /// Number of slots on the device.
    pub fn slots(&self) -> usize {
        self.inner.lock().slots
    }

    /// Number of slots holding a page.
    pub fn used(&self) -> usize {
        self.inner.lock().used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_core::BlockType;
    use crate::drivers::ram_disk::RamDisk;
    use alloc::boxed::Box;
    use proptest::prelude::*;

    fn swap_with(slots: u32) -> SwapSpace {
        let sectors = slots * SECTORS_PER_PAGE;
        SwapSpace::new(Block::new(
            "swap",
            BlockType::Swap,
            sectors,
            Box::new(RamDisk::new(sectors)),
        ))
    }

    fn page_of(byte: u8) -> Box<[u8; PAGE_FRAME_SIZE]> {
        Box::new([byte; PAGE_FRAME_SIZE])
    }

    #[test]
    fn handles_are_one_based_and_first_fit() {
        let swap = swap_with(3);
        let a = swap.swap_out(&page_of(1)).unwrap();
        let b = swap.swap_out(&page_of(2)).unwrap();
        assert_eq!((a.get(), a.index()), (1, 0));
        assert_eq!((b.get(), b.index()), (2, 1));

        swap.swap_free(a).unwrap();
        assert_eq!(swap.swap_out(&page_of(3)).unwrap(), a);
        assert_eq!(swap.used(), 2);
    }

    #[test]
    fn exhaustion_is_reported() {
        let swap = swap_with(2);
        swap.swap_out(&page_of(1)).unwrap();
        swap.swap_out(&page_of(2)).unwrap();
        assert_eq!(swap.swap_out(&page_of(3)), Err(VmError::SwapFull));
        assert_eq!(swap.used(), swap.slots());
    }

    #[test]
    fn swap_in_releases_the_slot() {
        let swap = swap_with(1);
        let slot = swap.swap_out(&page_of(7)).unwrap();
        let mut page = page_of(0);
        swap.swap_in(slot, &mut page).unwrap();
        assert!(page.iter().all(|&b| b == 7));
        assert_eq!(swap.used(), 0);

        assert_eq!(swap.swap_in(slot, &mut page), Err(VmError::InvalidSwapSlot));
        assert_eq!(swap.swap_free(slot), Err(VmError::InvalidSwapSlot));
    }

    #[test]
    fn partial_trailing_page_is_unused() {
        let sectors = 2 * SECTORS_PER_PAGE + 3;
        let swap = SwapSpace::new(Block::new(
            "swap",
            BlockType::Swap,
            sectors,
            Box::new(RamDisk::new(sectors)),
        ));
        assert_eq!(swap.slots(), 2);
    }

    proptest! {
        #[test]
        fn swap_round_trip(
            bytes in proptest::collection::vec(any::<u8>(), PAGE_FRAME_SIZE),
            filler in 1..4usize,
        ) {
            let swap = swap_with(4);
            for _ in 0..filler {
                swap.swap_out(&page_of(0xAA)).unwrap();
            }

            let mut page = page_of(0);
            page.copy_from_slice(&bytes);
            let slot = swap.swap_out(&page).unwrap();

            let mut back = page_of(0);
            swap.swap_in(slot, &mut back).unwrap();
            prop_assert_eq!(&back[..], &bytes[..]);
        }
    }
}
