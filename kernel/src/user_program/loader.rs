//! Lazy loading of user executables.
//!
//! Nothing is read beyond the headers: every page of every loadable segment
//! becomes a file-backed page table entry that the first fault reads in.

use super::elf::{
    Elf, ElfHeader, ElfProgramHeader, ElfProgramType, ElfUsage, ELF_HEADER_SIZE,
    PROGRAM_HEADER_SIZE,
};
use crate::mem::{
    fault::handle_fault,
    page_table::{Backing, PageKind, SupplementalPageTable},
    VmError,
};
use crate::vfs::{self, File, FileRef};
use alloc::vec;
use core::{cmp::min, fmt};
use kidneyos_vm_shared::mem::{
    is_page_aligned, is_user_vaddr, page_offset, page_round_down, OFFSET, PAGE_FRAME_SIZE,
};

const ELF_MAGIC_NUMBER: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const MACHINE_X86: u16 = 3;
const MAX_PROGRAM_HEADERS: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    InvalidMagicNumber,
    UnsupportedClass,
    UnsupportedEndianess,
    UnsupportedVersion,
    UnsupportedType,
    UnsupportedMachine,
    /// The program header table is not one this loader can read.
    BadProgramHeaders,
    /// The file ends inside the headers.
    Truncated,
    /// The command line does not fit in the first stack page.
    ArgumentsTooLong,
    SegmentError(ElfSegmentError),
    File(vfs::Error),
    Vm(VmError),
}

// Error types that will arise when we try to validate segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfSegmentError {
    DifferentPageOffset,
    OffsetOutOfRange,
    MemSizeLesserThanFileSize,
    EmptyMemSize,
    VMRegionOutOfRange,
    VMRegionWrapAround,
    PageZeroMapping,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::InvalidMagicNumber => write!(f, "not an ELF file"),
            ElfError::UnsupportedClass => write!(f, "not a 32-bit ELF"),
            ElfError::UnsupportedEndianess => write!(f, "not little-endian"),
            ElfError::UnsupportedVersion => write!(f, "unknown ELF version"),
            ElfError::UnsupportedType => write!(f, "not an executable"),
            ElfError::UnsupportedMachine => write!(f, "not an x86 executable"),
            ElfError::BadProgramHeaders => write!(f, "bad program header table"),
            ElfError::Truncated => write!(f, "truncated headers"),
            ElfError::ArgumentsTooLong => write!(f, "arguments too long"),
            ElfError::SegmentError(err) => write!(f, "bad segment: {err:?}"),
            ElfError::File(err) => write!(f, "{err}"),
            ElfError::Vm(err) => write!(f, "{err}"),
        }
    }
}

impl core::error::Error for ElfError {}

impl From<vfs::Error> for ElfError {
    fn from(err: vfs::Error) -> Self {
        ElfError::File(err)
    }
}

impl From<VmError> for ElfError {
    fn from(err: VmError) -> Self {
        ElfError::Vm(err)
    }
}

/// Where a freshly loaded program starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: usize,
    pub stack_pointer: usize,
}

fn verify_elf_header(header: &ElfHeader) -> Result<(), ElfError> {
    if header.magic != ELF_MAGIC_NUMBER {
        return Err(ElfError::InvalidMagicNumber);
    }
    // 1 for 32-bit
    if header.class != 1 {
        return Err(ElfError::UnsupportedClass);
    }
    // 1 for little endian
    if header.data_encoding != 1 {
        return Err(ElfError::UnsupportedEndianess);
    }
    if header.header_version != 1 || header.elf_version != 1 {
        return Err(ElfError::UnsupportedVersion);
    }
    if header.usage != ElfUsage::Executable {
        return Err(ElfError::UnsupportedType);
    }
    if header.machine != MACHINE_X86 {
        return Err(ElfError::UnsupportedMachine);
    }
    if header.program_header_entry_size as usize != PROGRAM_HEADER_SIZE
        || header.program_header_count > MAX_PROGRAM_HEADERS
    {
        return Err(ElfError::BadProgramHeaders);
    }
    Ok(())
}

fn validate_segment(phdr: &ElfProgramHeader, file_len: u64) -> Result<(), ElfSegmentError> {
    // p_offset and p_vaddr must have the same page offset.
    if page_offset(phdr.file_offset as usize) != page_offset(phdr.virtual_address as usize) {
        return Err(ElfSegmentError::DifferentPageOffset);
    }

    // p_offset must point within FILE.
    if u64::from(phdr.file_offset) > file_len {
        return Err(ElfSegmentError::OffsetOutOfRange);
    }

    // p_memsz must be at least as big as p_filesz.
    if phdr.memory_size < phdr.file_size {
        return Err(ElfSegmentError::MemSizeLesserThanFileSize);
    }

    // The segment must not be empty.
    if phdr.memory_size == 0 {
        return Err(ElfSegmentError::EmptyMemSize);
    }

    // The region cannot "wrap around" across the kernel virtual
    // address space.
    let end = phdr
        .virtual_address
        .checked_add(phdr.memory_size)
        .ok_or(ElfSegmentError::VMRegionWrapAround)?;

    // The virtual memory region must both start and end within the
    // user address space range.
    if !is_user_vaddr(phdr.virtual_address as usize) || end as usize > OFFSET {
        return Err(ElfSegmentError::VMRegionOutOfRange);
    }

    // Disallow mapping page 0.
    if (phdr.virtual_address as usize) < PAGE_FRAME_SIZE {
        return Err(ElfSegmentError::PageZeroMapping);
    }

    Ok(())
}

/// Register the pages of a segment starting at `upage`: the first
/// `read_bytes` come from `file` at `offset`, the following `zero_bytes` are
/// zero.
pub fn load_segment(
    pages: &SupplementalPageTable,
    file: &FileRef,
    mut offset: u64,
    mut upage: usize,
    mut read_bytes: usize,
    mut zero_bytes: usize,
    writable: bool,
) -> Result<(), VmError> {
    assert!((read_bytes + zero_bytes) % PAGE_FRAME_SIZE == 0);
    assert!(is_page_aligned(upage));
    assert!(offset % PAGE_FRAME_SIZE as u64 == 0);

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = min(read_bytes, PAGE_FRAME_SIZE);
        let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

        let backing = if page_read_bytes == 0 {
            Backing::Anonymous
        } else {
            Backing::File {
                file: file.clone(),
                offset,
                valid_bytes: page_read_bytes,
            }
        };
        let entry = pages.create(upage, PageKind::FileBacked, writable, backing)?;
        pages.insert(entry)?;

        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        offset += page_read_bytes as u64;
        upage += PAGE_FRAME_SIZE;
    }
    Ok(())
}

/// Create the first stack page, just below the kernel, and fault it in.
/// Returns the initial stack pointer.
pub fn setup_stack(pages: &SupplementalPageTable) -> Result<usize, VmError> {
    let entry = pages.create(
        OFFSET - PAGE_FRAME_SIZE,
        PageKind::SwapBacked,
        true,
        Backing::Anonymous,
    )?;
    pages.insert(entry)?;
    handle_fault(pages, OFFSET - PAGE_FRAME_SIZE, true)?;
    Ok(OFFSET)
}

/// Read the ELF headers of `file`.
pub fn read_elf(file: &dyn File) -> Result<Elf, ElfError> {
    let mut bytes = vec![0; ELF_HEADER_SIZE];
    if file.read_at(&mut bytes, 0)? != ELF_HEADER_SIZE {
        return Err(ElfError::Truncated);
    }
    let (_, header) = ElfHeader::parse(&bytes).map_err(|_| ElfError::Truncated)?;
    verify_elf_header(&header)?;

    let len = header.headers_len();
    if len as u64 > file.len() {
        return Err(ElfError::Truncated);
    }
    bytes.resize(len.max(ELF_HEADER_SIZE), 0);
    if file.read_at(&mut bytes, 0)? != bytes.len() {
        return Err(ElfError::Truncated);
    }
    Elf::parse_bytes(&bytes).map_err(|_| ElfError::Truncated)
}

/// Register every loadable segment of `file` and set up the stack.
pub fn load_elf(pages: &SupplementalPageTable, file: &FileRef) -> Result<LoadedImage, ElfError> {
    let elf = read_elf(&**file)?;

    for phdr in &elf.program_headers {
        match phdr.program_type {
            ElfProgramType::Load => {}
            ElfProgramType::Dynamic | ElfProgramType::Interpret | ElfProgramType::Shlib => {
                return Err(ElfError::UnsupportedType);
            }
            _ => continue,
        }
        validate_segment(phdr, file.len()).map_err(ElfError::SegmentError)?;

        let file_page = page_round_down(phdr.file_offset as usize);
        let mem_page = page_round_down(phdr.virtual_address as usize);
        let offset_in_page = page_offset(phdr.virtual_address as usize);
        let total = (offset_in_page + phdr.memory_size as usize).next_multiple_of(PAGE_FRAME_SIZE);
        let read_bytes = if phdr.file_size > 0 {
            offset_in_page + phdr.file_size as usize
        } else {
            0
        };
        load_segment(
            pages,
            file,
            file_page as u64,
            mem_page,
            read_bytes,
            total - read_bytes,
            phdr.writable,
        )?;
    }

    let stack_pointer = setup_stack(pages)?;
    log::debug!(
        "loaded {} segments, entry {:#X}",
        elf.program_headers.len(),
        elf.header.program_entry
    );
    Ok(LoadedImage {
        entry: elf.header.program_entry as usize,
        stack_pointer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::frame_table::tests::vm_with;
    use crate::mem::page_table::Location;
    use crate::mem::user::copy_from_user;
    use crate::paging::PageMap;
    use crate::user_program::elf::tests::build_elf;
    use crate::vfs::tempfs::TempFile;
    use alloc::sync::Arc;

    const PAGE: usize = PAGE_FRAME_SIZE;

    fn table() -> SupplementalPageTable {
        let (frames, _, _) = vm_with(4, 8);
        SupplementalPageTable::new(Arc::new(PageMap::new(1)), frames)
    }

    #[test]
    fn segment_pages_split_read_and_zero() {
        let pages = table();
        let file: FileRef = TempFile::with_contents(&[7; 2 * PAGE]);
        load_segment(&pages, &file, PAGE as u64, 0x0804_8000, PAGE + 10, 2 * PAGE - 10, true)
            .unwrap();

        assert_eq!(pages.pages(), [0x0804_8000, 0x0804_9000, 0x0804_A000]);
        assert_eq!(pages.lookup(0x0804_8000).unwrap().valid_bytes(), PAGE);
        assert_eq!(pages.lookup(0x0804_9000).unwrap().valid_bytes(), 10);
        assert_eq!(pages.lookup(0x0804_A000).unwrap().valid_bytes(), 0);
        assert!(pages.lookup(0x0804_A000).unwrap().writable());
        assert_eq!(pages.frames().resident(), 0);
    }

    #[test]
    fn stack_is_resident_and_zeroed() {
        let pages = table();
        assert_eq!(setup_stack(&pages), Ok(OFFSET));
        let entry = pages.lookup(OFFSET - 1).unwrap();
        assert!(matches!(entry.location(), Location::Resident(_)));
        let mut word = [1; 4];
        copy_from_user(&pages, OFFSET - 4, &mut word).unwrap();
        assert_eq!(word, [0; 4]);
    }

    #[test]
    fn executables_load_lazily() {
        let pages = table();
        let mut bytes = build_elf(
            0x0804_8100,
            &[
                (0, 0x0804_8000, 0x180, 0x180, false),
                (0x1000, 0x0804_9000, 0x20, 0x1800, true),
            ],
            0x1020,
        );
        bytes[0x100..0x104].copy_from_slice(b"code");
        bytes[0x1000..0x1004].copy_from_slice(b"data");
        let file: FileRef = TempFile::with_contents(&bytes);

        let image = load_elf(&pages, &file).unwrap();
        assert_eq!(
            image,
            LoadedImage {
                entry: 0x0804_8100,
                stack_pointer: OFFSET
            }
        );
        // Text, two data pages, the stack.
        assert_eq!(pages.len(), 4);
        assert_eq!(pages.frames().resident(), 1);
        assert!(!pages.lookup(0x0804_8000).unwrap().writable());

        let mut buf = [0; 4];
        copy_from_user(&pages, 0x0804_8100, &mut buf).unwrap();
        assert_eq!(&buf, b"code");
        copy_from_user(&pages, 0x0804_9000, &mut buf).unwrap();
        assert_eq!(&buf, b"data");
        // Past the file bytes the segment is zero.
        copy_from_user(&pages, 0x0804_9020, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
        copy_from_user(&pages, 0x0804_A7FC, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn bad_headers_are_rejected() {
        let pages = table();
        let good = build_elf(0, &[(0, 0x0804_8000, 4, 4, false)], 64);

        let mut bad = good.clone();
        bad[0] = 0;
        let file: FileRef = TempFile::with_contents(&bad);
        assert_eq!(load_elf(&pages, &file), Err(ElfError::InvalidMagicNumber));

        let mut bad = good.clone();
        bad[18] = 0x3E;
        let file: FileRef = TempFile::with_contents(&bad);
        assert_eq!(load_elf(&pages, &file), Err(ElfError::UnsupportedMachine));

        let file: FileRef = TempFile::with_contents(&good[..40]);
        assert_eq!(load_elf(&pages, &file), Err(ElfError::Truncated));

        let zero_page = build_elf(0, &[(0, 0, 4, 4, false)], 64);
        let file: FileRef = TempFile::with_contents(&zero_page);
        assert_eq!(
            load_elf(&pages, &file),
            Err(ElfError::SegmentError(ElfSegmentError::PageZeroMapping))
        );

        let kernel = build_elf(0, &[(0, 0x7FFF_F000, 4, 0x2000, false)], 64);
        let file: FileRef = TempFile::with_contents(&kernel);
        assert_eq!(
            load_elf(&pages, &file),
            Err(ElfError::SegmentError(ElfSegmentError::VMRegionOutOfRange))
        );
        assert!(pages.is_empty());
    }
}
