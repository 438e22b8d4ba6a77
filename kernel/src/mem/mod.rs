//! Demand-paged virtual memory.
//!
//! A page fault resolves through the faulting process's
//! [`SupplementalPageTable`](page_table::SupplementalPageTable). A
//! non-resident page gets a frame from the global
//! [`FrameTable`](frame_table::FrameTable), which evicts with the clock
//! algorithm when the [`PagePool`](frame_pool::PagePool) is empty and spills
//! anonymous data to the [`SwapSpace`](swapping::SwapSpace).
//!
//! Lock order: frame table, then page entry, then swap space or file. Nothing
//! that holds a page entry lock may take the frame table lock.

pub mod fault;
pub mod frame_pool;
pub mod frame_table;
pub mod mmap;
pub mod page_replacement;
pub mod page_table;
pub mod swapping;
pub mod user;

use crate::block::block_error::BlockError;
use crate::vfs;
use core::fmt;
use kidneyos_vm_shared::mem::PAGE_FRAME_SIZE;

/// Number of a physical page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame(u32);

impl PhysFrame {
    pub const fn new(number: u32) -> Self {
        Self(number)
    }

    pub const fn number(self) -> u32 {
        self.0
    }

    pub const fn start_address(self) -> usize {
        self.0 as usize * PAGE_FRAME_SIZE
    }
}

impl fmt::Display for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {:#X}", self.start_address())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No page table entry covers the address
    NotMapped,
    /// Write to a read-only page
    ReadOnly,
    /// The page table entry was deleted
    Freed,
    /// Address is null, unaligned, or not a user address
    BadAddress,
    /// A page table entry already exists for the page
    AlreadyMapped,
    /// No frame could be freed for the allocation
    OutOfFrames,
    /// Every swap slot is in use
    SwapFull,
    /// Swap slot is out of range or holds nothing
    InvalidSwapSlot,
    /// A page load read fewer bytes than the page records
    ShortRead,
    /// A write-back wrote fewer bytes than the page records
    ShortWrite,
    /// The swap device failed
    Block(BlockError),
    /// The backing file failed
    File(vfs::Error),
}

impl fmt::Debug for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::NotMapped => write!(f, "NotMapped"),
            VmError::ReadOnly => write!(f, "ReadOnly"),
            VmError::Freed => write!(f, "Freed"),
            VmError::BadAddress => write!(f, "BadAddress"),
            VmError::AlreadyMapped => write!(f, "AlreadyMapped"),
            VmError::OutOfFrames => write!(f, "OutOfFrames"),
            VmError::SwapFull => write!(f, "SwapFull"),
            VmError::InvalidSwapSlot => write!(f, "InvalidSwapSlot"),
            VmError::ShortRead => write!(f, "ShortRead"),
            VmError::ShortWrite => write!(f, "ShortWrite"),
            VmError::Block(err) => write!(f, "Block({err:?})"),
            VmError::File(err) => write!(f, "File({err:?})"),
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::NotMapped => write!(f, "no page covers the address"),
            VmError::ReadOnly => write!(f, "write to a read-only page"),
            VmError::Freed => write!(f, "page was deleted"),
            VmError::BadAddress => write!(f, "bad user address"),
            VmError::AlreadyMapped => write!(f, "page already mapped"),
            VmError::OutOfFrames => write!(f, "no frame can be freed"),
            VmError::SwapFull => write!(f, "swap space exhausted"),
            VmError::InvalidSwapSlot => write!(f, "invalid swap slot"),
            VmError::ShortRead => write!(f, "short read while loading page"),
            VmError::ShortWrite => write!(f, "short write while writing back page"),
            VmError::Block(err) => write!(f, "swap device: {err}"),
            VmError::File(err) => write!(f, "backing file: {err}"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        VmError::Block(err)
    }
}

impl From<vfs::Error> for VmError {
    fn from(err: vfs::Error) -> Self {
        VmError::File(err)
    }
}

pub type Result<T> = core::result::Result<T, VmError>;
