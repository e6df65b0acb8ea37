use super::elf::{Elf, ElfError};
use super::Pid;
use crate::fs::BackingFile;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::mem::{
    is_user_vaddr, page_offset, page_round_down, pages_spanned, PAGE_FRAME_SIZE,
};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// First program segment, mapped read-only.
    Code,
    /// Second program segment.
    Data,
    Stack,
}

impl RegionKind {
    pub fn writable(self) -> bool {
        !matches!(self, Self::Code)
    }
}

/// Where a page's initial contents come from in the program image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpan {
    pub file_offset: u64,
    /// Byte offset within the frame where the data lands.
    pub frame_offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct Region {
    kind: RegionKind,
    base: usize,
    npages: usize,
    file_offset: usize,
    file_size: usize,
}

impl Region {
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn end(&self) -> usize {
        self.base + self.npages * PAGE_FRAME_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.base..self.end()).contains(&addr)
    }

    /// The image bytes that belong in the page at `page`, if any.
    ///
    /// File data starts at the file offset's position within the first page
    /// and runs for the segment's file size. Pages past it are zero-filled.
    pub fn image_span(&self, page: usize) -> Option<ImageSpan> {
        debug_assert_eq!(page_offset(page), 0);
        let start = self.base + page_offset(self.file_offset);
        let end = start + self.file_size;
        let lo = page.max(start);
        let hi = (page + PAGE_FRAME_SIZE).min(end);
        (lo < hi).then(|| ImageSpan {
            file_offset: (self.file_offset + (lo - start)) as u64,
            frame_offset: lo - page,
            len: hi - lo,
        })
    }
}

#[derive(Debug, Default, Clone)]
struct RegionList(BTreeMap<usize, Region>);

impl RegionList {
    fn region_at(&self, addr: usize) -> Option<&Region> {
        let (_, region) = self.0.range(..=addr).next_back()?;
        region.contains(addr).then_some(region)
    }

    fn is_address_range_free(&self, range: Range<usize>) -> bool {
        if self.region_at(range.start).is_some() {
            return false;
        }
        self.0.range(range).next().is_none()
    }

    fn add(&mut self, region: Region) -> Result<(), AddressSpaceError> {
        if !self.is_address_range_free(region.base..region.end()) {
            return Err(AddressSpaceError::Overlap);
        }
        self.0.insert(region.base, region);
        Ok(())
    }

    fn segment_count(&self) -> usize {
        self.0
            .values()
            .filter(|region| region.kind != RegionKind::Stack)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// only a code and a data segment are supported
    TooManyRegions,
    Overlap,
    OutOfUserSpace,
    EmptyRegion,
    Elf(ElfError),
}

impl fmt::Display for AddressSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyRegions => write!(f, "too many regions"),
            Self::Overlap => write!(f, "region overlaps an existing region"),
            Self::OutOfUserSpace => write!(f, "region extends outside user space"),
            Self::EmptyRegion => write!(f, "empty region"),
            Self::Elf(err) => write!(f, "{err}"),
        }
    }
}

impl core::error::Error for AddressSpaceError {}

impl From<ElfError> for AddressSpaceError {
    fn from(err: ElfError) -> Self {
        Self::Elf(err)
    }
}

/// A user process's view of memory: its regions, program image and frame budget.
pub struct AddressSpace {
    pid: Pid,
    regions: RegionList,
    image: Option<Arc<dyn BackingFile>>,
    allocated_frames: AtomicUsize,
    max_frames: usize,
}

impl AddressSpace {
    pub fn new(pid: Pid, max_frames: usize) -> Self {
        Self {
            pid,
            regions: RegionList::default(),
            image: None,
            allocated_frames: AtomicUsize::new(0),
            max_frames,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn image(&self) -> Option<&dyn BackingFile> {
        self.image.as_deref()
    }

    pub fn set_image(&mut self, image: Arc<dyn BackingFile>) {
        self.image = Some(image);
    }

    /// Define the next program segment. The first becomes the code region,
    /// the second the data region.
    pub fn define_region(
        &mut self,
        vaddr: usize,
        memory_size: usize,
        file_offset: usize,
        file_size: usize,
    ) -> Result<RegionKind, AddressSpaceError> {
        let kind = match self.regions.segment_count() {
            0 => RegionKind::Code,
            1 => RegionKind::Data,
            _ => return Err(AddressSpaceError::TooManyRegions),
        };
        if memory_size == 0 {
            return Err(AddressSpaceError::EmptyRegion);
        }
        let end = vaddr
            .checked_add(memory_size)
            .ok_or(AddressSpaceError::OutOfUserSpace)?;
        if !is_user_vaddr(end - 1) {
            return Err(AddressSpaceError::OutOfUserSpace);
        }

        self.regions.add(Region {
            kind,
            base: page_round_down(vaddr),
            npages: pages_spanned(vaddr, memory_size),
            file_offset,
            file_size,
        })?;
        Ok(kind)
    }

    /// Define `pages` of stack directly below `top`. Returns the initial stack pointer.
    pub fn define_stack(&mut self, top: usize, pages: usize) -> Result<usize, AddressSpaceError> {
        if pages == 0 {
            return Err(AddressSpaceError::EmptyRegion);
        }
        let base = pages
            .checked_mul(PAGE_FRAME_SIZE)
            .and_then(|size| top.checked_sub(size))
            .ok_or(AddressSpaceError::OutOfUserSpace)?;
        if page_offset(top) != 0 || !is_user_vaddr(top - 1) {
            return Err(AddressSpaceError::OutOfUserSpace);
        }

        self.regions.add(Region {
            kind: RegionKind::Stack,
            base,
            npages: pages,
            file_offset: 0,
            file_size: 0,
        })?;
        Ok(top)
    }

    pub fn region_at(&self, addr: usize) -> Option<&Region> {
        self.regions.region_at(addr)
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.0.values()
    }

    /// Define the code and data regions from an ELF image and keep the image
    /// for demand loading. Returns the entry point.
    pub fn load_elf(&mut self, image: Arc<dyn BackingFile>) -> Result<usize, AddressSpaceError> {
        let elf = Elf::read(image.as_ref())?;
        for segment in elf.loadable_segments() {
            let kind = self.define_region(
                segment.virtual_address as usize,
                segment.memory_size as usize,
                segment.file_offset as usize,
                segment.file_size as usize,
            )?;
            debug!(
                "pid {}: {:?} region at {:#x} ({} bytes, {} from file offset {:#x})",
                self.pid,
                kind,
                segment.virtual_address,
                segment.memory_size,
                segment.file_size,
                segment.file_offset
            );
        }
        self.image = Some(image);
        Ok(elf.header.program_entry as usize)
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn allocated_frames(&self) -> usize {
        self.allocated_frames.load(Ordering::Acquire)
    }

    pub fn at_ceiling(&self) -> bool {
        self.allocated_frames() >= self.max_frames
    }

    /// Count one more frame against the ceiling. Fails if the ceiling is reached.
    pub fn try_charge_frame(&self) -> bool {
        self.allocated_frames
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.max_frames).then_some(count + 1)
            })
            .is_ok()
    }

    pub fn uncharge_frame(&self) {
        let previous = self.allocated_frames.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(previous, 0, "pid {} frame count underflow", self.pid);
    }

    pub fn reset_frames(&self) {
        self.allocated_frames.store(0, Ordering::Release);
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pid", &self.pid)
            .field("regions", &self.regions)
            .field("allocated_frames", &self.allocated_frames())
            .field("max_frames", &self.max_frames)
            .finish_non_exhaustive()
    }
}
