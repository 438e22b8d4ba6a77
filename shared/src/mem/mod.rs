use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// How far below [`OFFSET`] a user stack may grow.
pub const STACK_LIMIT: usize = 8 * MB;

/// Largest distance below the stack pointer that a faulting access may land
/// and still count as a push (`pusha` writes 32 bytes below `esp`).
pub const STACK_SLACK: usize = 32;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

/// Number of pages needed to hold `len` bytes.
#[inline]
pub const fn pages_spanning(len: usize) -> usize {
    len.div_ceil(PAGE_FRAME_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_offset(0x1234), 0x234);
        assert!(is_page_aligned(0x8000));
        assert!(!is_page_aligned(0x8001));
    }

    #[test]
    fn spanning() {
        assert_eq!(pages_spanning(0), 0);
        assert_eq!(pages_spanning(1), 1);
        assert_eq!(pages_spanning(PAGE_FRAME_SIZE), 1);
        assert_eq!(pages_spanning(PAGE_FRAME_SIZE + 1), 2);
    }
}
