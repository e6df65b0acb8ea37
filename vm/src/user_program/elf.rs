use nom::bytes::complete::{tag, take};
use nom::combinator::{map, map_opt};
use nom::number::complete::{u16, u32, u8};
use nom::number::Endianness;
use nom::IResult;

use crate::fs::{BackingFile, FileError};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use kidneyos_shared::mem::{is_user_vaddr, page_offset, PAGE_FRAME_SIZE};

const ELF_MAGIC_NUMBER: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_HEADER_SIZE: usize = 52;
const PROGRAM_HEADER_SIZE: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfEndianness {
    Little,
    Big,
}

impl ElfEndianness {
    fn to_nom(self) -> Endianness {
        match self {
            ElfEndianness::Little => Endianness::Little,
            ElfEndianness::Big => Endianness::Big,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfUsage {
    Relocatable,
    Executable,
    Shared,
    Core,
}

// Common Architectures from https://wiki.osdev.org/ELF
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfArchitecture {
    Generic,
    Sparc,
    Mips,
    PowerPC,
    RiscV,
    Ia64,
    X86,
    X8664,
    Arm,
    Arm64,
}

// Strictly 32-bit ELFs.
#[derive(Copy, Clone, Debug)]
pub struct ElfHeader {
    pub endianness: ElfEndianness,
    pub usage: ElfUsage,
    pub architecture: ElfArchitecture,
    pub program_entry: u32,
    pub program_headers_offset: u32,
    pub program_header_entry_size: u16,
    pub program_header_count: u16,
}

impl ElfHeader {
    pub fn parse(bytes: &[u8]) -> IResult<&[u8], ElfHeader> {
        let (bytes, _) = tag(&ELF_MAGIC_NUMBER[..])(bytes)?;

        // Elf Bit Width, we don't parse 64-bits ELF binaries.
        let (bytes, _) = tag(&[1u8][..])(bytes)?;

        let (bytes, endianness) = map_opt(u8, |value| match value {
            1 => Some(ElfEndianness::Little),
            2 => Some(ElfEndianness::Big),
            _ => None,
        })(bytes)?;

        let endian = endianness.to_nom();

        // Header version, ABI and padding.
        let (bytes, _) = take(10usize)(bytes)?;

        let (bytes, usage) = map_opt(u16(endian), |value| match value {
            1 => Some(ElfUsage::Relocatable),
            2 => Some(ElfUsage::Executable),
            3 => Some(ElfUsage::Shared),
            4 => Some(ElfUsage::Core),
            _ => None,
        })(bytes)?;

        let (bytes, architecture) = map_opt(u16(endian), |value| match value {
            0x00 => Some(ElfArchitecture::Generic),
            0x02 => Some(ElfArchitecture::Sparc),
            0x03 => Some(ElfArchitecture::X86),
            0x08 => Some(ElfArchitecture::Mips),
            0x14 => Some(ElfArchitecture::PowerPC),
            0x28 => Some(ElfArchitecture::Arm),
            0x32 => Some(ElfArchitecture::Ia64),
            0x3E => Some(ElfArchitecture::X8664),
            0xB7 => Some(ElfArchitecture::Arm64),
            0xF3 => Some(ElfArchitecture::RiscV),
            _ => None,
        })(bytes)?;

        let (bytes, _elf_version) = u32(endian)(bytes)?;
        let (bytes, program_entry) = u32(endian)(bytes)?;
        let (bytes, program_headers_offset) = u32(endian)(bytes)?;
        let (bytes, _section_headers_offset) = u32(endian)(bytes)?;
        let (bytes, _flags) = u32(endian)(bytes)?;
        let (bytes, _elf_header_size) = u16(endian)(bytes)?;
        let (bytes, program_header_entry_size) = u16(endian)(bytes)?;
        let (bytes, program_header_count) = u16(endian)(bytes)?;

        // Section headers are of no use to the loader.
        let (bytes, _) = take(6usize)(bytes)?;

        Ok((
            bytes,
            ElfHeader {
                endianness,
                usage,
                architecture,
                program_entry,
                program_headers_offset,
                program_header_entry_size,
                program_header_count,
            },
        ))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ElfProgramType {
    Ignore,
    Load,
    Dynamic,
    Interpret,
    Note,
    Other(u32),
}

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
}

impl ElfProgramHeader {
    pub fn parse(bytes: &[u8], endian: Endianness) -> IResult<&[u8], Self> {
        let (bytes, program_type) = map(u32(endian), |value| match value {
            0 => ElfProgramType::Ignore,
            1 => ElfProgramType::Load,
            2 => ElfProgramType::Dynamic,
            3 => ElfProgramType::Interpret,
            4 => ElfProgramType::Note,
            other => ElfProgramType::Other(other),
        })(bytes)?;

        let (bytes, file_offset) = u32(endian)(bytes)?;
        let (bytes, virtual_address) = u32(endian)(bytes)?;
        let (bytes, _physical_address) = u32(endian)(bytes)?;
        let (bytes, file_size) = u32(endian)(bytes)?;
        let (bytes, memory_size) = u32(endian)(bytes)?;
        let (bytes, flags) = u32(endian)(bytes)?;
        let (bytes, _alignment) = u32(endian)(bytes)?;

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
            },
        ))
    }

    /// Checks that the segment can be demand-loaded from an image of `image_size` bytes.
    pub fn validate(&self, image_size: u64) -> Result<(), ElfSegmentError> {
        let vaddr = self.virtual_address as usize;

        // p_offset and p_vaddr must have the same page offset.
        if page_offset(self.file_offset as usize) != page_offset(vaddr) {
            return Err(ElfSegmentError::DifferentPageOffset);
        }

        // The file bytes must lie within the image.
        if u64::from(self.file_offset) + u64::from(self.file_size) > image_size {
            return Err(ElfSegmentError::OffsetOutOfRange);
        }

        if self.memory_size < self.file_size {
            return Err(ElfSegmentError::MemSizeLesserThanFileSize);
        }

        if self.memory_size == 0 {
            return Err(ElfSegmentError::EmptyMemSize);
        }

        // The region must both start and end within user space.
        let end = vaddr
            .checked_add(self.memory_size as usize)
            .ok_or(ElfSegmentError::VMRegionWrapAround)?;
        if !is_user_vaddr(vaddr) || !is_user_vaddr(end - 1) {
            return Err(ElfSegmentError::VMRegionOutOfRange);
        }

        // Disallow mapping page 0.
        if vaddr < PAGE_FRAME_SIZE {
            return Err(ElfSegmentError::PageZeroMapping);
        }

        Ok(())
    }
}

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// the headers could not be parsed
    Malformed,
    /// not an executable
    UnsupportedType,
    Segment(ElfSegmentError),
    Io(FileError),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed ELF headers"),
            Self::UnsupportedType => write!(f, "ELF image is not an executable"),
            Self::Segment(err) => write!(f, "invalid loadable segment: {err:?}"),
            Self::Io(err) => write!(f, "reading ELF image: {err}"),
        }
    }
}

impl core::error::Error for ElfError {}

impl From<FileError> for ElfError {
    fn from(err: FileError) -> Self {
        Self::Io(err)
    }
}

#[derive(Clone, Debug)]
pub struct Elf {
    pub header: ElfHeader,
    pub program_headers: Vec<ElfProgramHeader>,
}

impl Elf {
    /// Parse the ELF and program headers of `image`, validating every
    /// loadable segment. Segment contents are left on disk.
    pub fn read(image: &dyn BackingFile) -> Result<Elf, ElfError> {
        let mut header_bytes = [0u8; ELF_HEADER_SIZE];
        image.read_exact_at(0, &mut header_bytes)?;
        let (_, header) = ElfHeader::parse(&header_bytes).map_err(|_| ElfError::Malformed)?;

        if header.usage != ElfUsage::Executable {
            return Err(ElfError::UnsupportedType);
        }

        let entry_size = usize::from(header.program_header_entry_size);
        if entry_size < PROGRAM_HEADER_SIZE {
            return Err(ElfError::Malformed);
        }

        let mut table = vec![0u8; entry_size * usize::from(header.program_header_count)];
        image.read_exact_at(u64::from(header.program_headers_offset), &mut table)?;

        let endian = header.endianness.to_nom();
        let program_headers = table
            .chunks_exact(entry_size)
            .map(|entry| ElfProgramHeader::parse(entry, endian).map(|(_, ph)| ph))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ElfError::Malformed)?;

        let image_size = image.size();
        for ph in program_headers
            .iter()
            .filter(|ph| ph.program_type == ElfProgramType::Load)
        {
            ph.validate(image_size).map_err(ElfError::Segment)?;
        }

        Ok(Elf {
            header,
            program_headers,
        })
    }

    pub fn loadable_segments(&self) -> impl Iterator<Item = &ElfProgramHeader> {
        self.program_headers
            .iter()
            .filter(|ph| ph.program_type == ElfProgramType::Load)
    }
}


#[cfg(test)]
mod tests {
    use super::test_image::{build, Segment};
    use super::*;
    use crate::fs::MemFile;

    #[test]
    fn reads_loadable_segments() {
        let image = MemFile::from_bytes(build(
            0x0040_0100,
            &[
                Segment {
                    vaddr: 0x0040_0100,
                    offset: 0x100,
                    data: &[0xAA; 64],
                    memory_size: 64,
                    flags: 5,
                },
                Segment {
                    vaddr: 0x1000_0200,
                    offset: 0x200,
                    data: &[0xBB; 16],
                    memory_size: 0x2000,
                    flags: 6,
                },
            ],
        ));

        let elf = Elf::read(&image).expect("valid image");
        assert_eq!(elf.header.program_entry, 0x0040_0100);
        assert_eq!(elf.header.architecture, ElfArchitecture::Mips);
        let segments: Vec<_> = elf.loadable_segments().collect();
        assert_eq!(segments.len(), 2);
        assert!(segments[0].executable && !segments[0].writable);
        assert_eq!(segments[1].file_size, 16);
        assert_eq!(segments[1].memory_size, 0x2000);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = build(0, &[]);
        bytes[0] = 0;
        assert_eq!(
            Elf::read(&MemFile::from_bytes(bytes)).map(|_| ()),
            Err(ElfError::Malformed)
        );
    }

    #[test]
    fn rejects_truncated_image() {
        assert!(matches!(
            Elf::read(&MemFile::from_bytes(vec![0x7F, b'E'])),
            Err(ElfError::Io(FileError::ShortTransfer { .. }))
        ));
    }

    #[test]
    fn segment_validation() {
        let ok = ElfProgramHeader {
            program_type: ElfProgramType::Load,
            file_offset: 0x64,
            virtual_address: 0x0040_0064,
            file_size: 10,
            memory_size: 10,
            executable: true,
            writable: false,
            readable: true,
        };
        assert_eq!(ok.validate(0x200), Ok(()));
        assert_eq!(
            ok.validate(0x6D),
            Err(ElfSegmentError::OffsetOutOfRange)
        );

        let misaligned = ElfProgramHeader {
            virtual_address: 0x0040_0000,
            ..ok
        };
        assert_eq!(
            misaligned.validate(0x200),
            Err(ElfSegmentError::DifferentPageOffset)
        );

        let page_zero = ElfProgramHeader {
            virtual_address: 0x64,
            ..ok
        };
        assert_eq!(
            page_zero.validate(0x200),
            Err(ElfSegmentError::PageZeroMapping)
        );

        let kernel = ElfProgramHeader {
            virtual_address: 0x7FFF_F064,
            memory_size: 0x2000,
            ..ok
        };
        assert_eq!(
            kernel.validate(0x200),
            Err(ElfSegmentError::VMRegionOutOfRange)
        );
    }
}
