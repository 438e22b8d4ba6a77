use nom::bytes::complete::take;
use nom::error::Error;
use nom::number::complete::{le_u16, le_u32, u8};
use nom::IResult;

use alloc::vec::Vec;

/// Size of a 32-bit ELF header.
pub const ELF_HEADER_SIZE: usize = 52;
/// Size of a 32-bit ELF program header.
pub const PROGRAM_HEADER_SIZE: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfUsage {
    Relocatable,
    Executable,
    Shared,
    Core,
    Other(u16),
}

// Strictly 32-bit, little-endian ELFs. The identification bytes are kept raw
// so the loader can say what it does not support.
#[derive(Copy, Clone, Debug)]
pub struct ElfHeader {
    pub magic: [u8; 4],
    pub class: u8,
    pub data_encoding: u8,
    pub header_version: u8,
    pub usage: ElfUsage,
    pub machine: u16,
    pub elf_version: u32,
    pub program_entry: u32,
    pub program_headers_offset: u32,
    pub program_header_entry_size: u16,
    pub program_header_count: u16,
}

impl ElfHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], ElfHeader> {
        let (bytes, magic) = take(4usize)(bytes)?;
        let (bytes, class) = u8(bytes)?;
        let (bytes, data_encoding) = u8(bytes)?;
        let (bytes, header_version) = u8(bytes)?;

        // ABI, ABI version, padding.
        let (bytes, _) = take(9usize)(bytes)?;

        let (bytes, usage) = le_u16(bytes)?;
        let usage = match usage {
            1 => ElfUsage::Relocatable,
            2 => ElfUsage::Executable,
            3 => ElfUsage::Shared,
            4 => ElfUsage::Core,
            other => ElfUsage::Other(other),
        };
        let (bytes, machine) = le_u16(bytes)?;

        let (bytes, elf_version) = le_u32(bytes)?;
        let (bytes, program_entry) = le_u32(bytes)?;
        let (bytes, program_headers_offset) = le_u32(bytes)?;
        let (bytes, _section_headers_offset) = le_u32(bytes)?;
        let (bytes, _flags) = le_u32(bytes)?;

        let (bytes, _elf_header_size) = le_u16(bytes)?;
        let (bytes, program_header_entry_size) = le_u16(bytes)?;
        let (bytes, program_header_count) = le_u16(bytes)?;
        let (bytes, _section_header_entry_size) = le_u16(bytes)?;
        let (bytes, _section_header_count) = le_u16(bytes)?;
        let (bytes, _section_header_index) = le_u16(bytes)?;

        let mut magic_bytes = [0; 4];
        magic_bytes.copy_from_slice(magic);

        Ok((
            bytes,
            ElfHeader {
                magic: magic_bytes,
                class,
                data_encoding,
                header_version,
                usage,
                machine,
                elf_version,
                program_entry,
                program_headers_offset,
                program_header_entry_size,
                program_header_count,
            },
        ))
    }

    /// Bytes from the start of the file to the end of the program header
    /// table.
    pub fn headers_len(&self) -> usize {
        self.program_headers_offset as usize
            + self.program_header_count as usize * self.program_header_entry_size as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfProgramType {
    Ignore,
    Load,
    Dynamic,
    Interpret,
    Note,
    Shlib,
    ProgramHeaders,
    Stack,
    OsSpecific(u32),
    Unknown(u32),
}

// The segment's bytes stay in the file; pages are read from there on demand.
#[derive(Copy, Clone, Debug)]
pub struct ElfProgramHeader {
    pub program_type: ElfProgramType,
    pub file_offset: u32,
    pub virtual_address: u32,
    pub file_size: u32,
    pub memory_size: u32,
    pub executable: bool,
    pub writable: bool,
    pub readable: bool,
    pub alignment: u32,
}

impl ElfProgramHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], Self> {
        let (bytes, program_type) = le_u32(bytes)?;
        let program_type = match program_type {
            0 => ElfProgramType::Ignore,
            1 => ElfProgramType::Load,
            2 => ElfProgramType::Dynamic,
            3 => ElfProgramType::Interpret,
            4 => ElfProgramType::Note,
            5 => ElfProgramType::Shlib,
            6 => ElfProgramType::ProgramHeaders,
            0x6474_e551 => ElfProgramType::Stack,
            value @ 0x6000_0000.. => ElfProgramType::OsSpecific(value), // OS Specific Headers
            value => ElfProgramType::Unknown(value),
        };

        let (bytes, file_offset) = le_u32(bytes)?;
        let (bytes, virtual_address) = le_u32(bytes)?;
        let (bytes, _physical_address) = le_u32(bytes)?;
        let (bytes, file_size) = le_u32(bytes)?;
        let (bytes, memory_size) = le_u32(bytes)?;
        let (bytes, flags) = le_u32(bytes)?;
        let (bytes, alignment) = le_u32(bytes)?;

        let executable = flags & 1 != 0;
        let writable = flags & 2 != 0;
        let readable = flags & 4 != 0;

        Ok((
            bytes,
            ElfProgramHeader {
                program_type,
                file_offset,
                virtual_address,
                file_size,
                memory_size,
                executable,
                writable,
                readable,
                alignment,
            },
        ))
    }
}

#[derive(Clone, Debug)]
pub struct Elf {
    pub header: ElfHeader,
    pub program_headers: Vec<ElfProgramHeader>,
}

impl Elf {
    /// Parse the ELF header and program header table out of `full_bytes`,
    /// which must start at the beginning of the file and cover at least
    /// [`ElfHeader::headers_len`] bytes.
    pub fn parse(full_bytes: &[u8]) -> IResult<&[u8], Elf> {
        let (bytes, header) = ElfHeader::parse(full_bytes)?;

        let (mut program_header_bytes, _) = take(header.program_headers_offset)(full_bytes)?;

        let mut program_headers = Vec::with_capacity(header.program_header_count as usize);

        for _ in 0..header.program_header_count {
            let (_, program_header) = ElfProgramHeader::parse(program_header_bytes)?;

            program_headers.push(program_header);

            (program_header_bytes, _) =
                take(header.program_header_entry_size)(program_header_bytes)?;
        }

        Ok((
            bytes,
            Elf {
                header,
                program_headers,
            },
        ))
    }

    pub fn parse_bytes(bytes: &[u8]) -> Result<Elf, nom::Err<Error<&[u8]>>> {
        Ok(Self::parse(bytes)?.1)
    }
}
