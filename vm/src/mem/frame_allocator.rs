mod placement_algorithms;

pub use placement_algorithms::{FirstFit, NextFit, PlacementAlgorithm};

use super::FrameAllocator;
use crate::sync::Mutex;
use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    /// The allocation continues into the following frame.
    #[bit(1, rw)]
    next: bool,
}

/// No run of free frames satisfies the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out of physical frames")
    }
}

impl core::error::Error for AllocError {}

struct CoreMap<P> {
    entries: Box<[CoreMapEntry]>,
    placement: P,
    frames_allocated: usize,
}

impl<P: PlacementAlgorithm> CoreMap<P> {
    fn alloc(&mut self, frames_requested: usize) -> Result<usize, AllocError> {
        if self.frames_allocated + frames_requested > self.entries.len() {
            return Err(AllocError);
        }

        let range = self.placement.place(&self.entries, frames_requested)?;
        let last = range.end - 1;
        for i in range.clone() {
            assert!(!self.entries[i].allocated(), "frame {i} handed out twice");
            self.entries[i] = CoreMapEntry::DEFAULT
                .with_allocated(true)
                .with_next(i != last);
        }

        self.frames_allocated += range.len();
        Ok(range.start)
    }

    fn dealloc(&mut self, start: usize) -> usize {
        assert!(
            self.entries[start].allocated(),
            "frame {start} released while free"
        );

        let mut freed = 0;
        for entry in self.entries[start..].iter_mut() {
            let more = entry.next();
            *entry = CoreMapEntry::DEFAULT;
            freed += 1;
            if !more {
                break;
            }
        }

        self.frames_allocated -= freed;
        freed
    }
}

/// Frame allocator over a core map of one entry per physical frame.
pub struct CoreMapAllocator<P = NextFit> {
    core_map: Mutex<CoreMap<P>>,
    active: AtomicBool,
}

impl<P: PlacementAlgorithm> CoreMapAllocator<P> {
    pub fn new(frames_in_system: usize) -> Self {
        Self {
            core_map: Mutex::new(CoreMap {
                entries: vec![CoreMapEntry::DEFAULT; frames_in_system].into_boxed_slice(),
                placement: P::default(),
                frames_allocated: 0,
            }),
            active: AtomicBool::new(true),
        }
    }

    /// Permanently take frames out of circulation, e.g. those holding the kernel image.
    pub fn reserve(&self, frames: core::ops::Range<usize>) {
        let mut core_map = self.core_map.lock();
        for i in frames {
            if !core_map.entries[i].allocated() {
                core_map.entries[i] = CoreMapEntry::DEFAULT.with_allocated(true);
                core_map.frames_allocated += 1;
            }
        }
    }

    pub fn frames_allocated(&self) -> usize {
        self.core_map.lock().frames_allocated
    }

    pub fn free_frames(&self) -> usize {
        let core_map = self.core_map.lock();
        core_map.entries.len() - core_map.frames_allocated
    }

    /// Stop handing out frames. Releases are still accepted.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl<P: PlacementAlgorithm> FrameAllocator for CoreMapAllocator<P> {
    fn allocate(&self, frames: usize) -> Option<usize> {
        if !self.is_active() {
            return None;
        }
        self.core_map.lock().alloc(frames).ok()
    }

    fn release(&self, frame: usize) {
        self.core_map.lock().dealloc(frame);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_release_as_a_unit() {
        let allocator = CoreMapAllocator::<FirstFit>::new(8);
        assert_eq!(allocator.allocate(3), Some(0));
        assert_eq!(allocator.allocate(2), Some(3));
        assert_eq!(allocator.frames_allocated(), 5);

        allocator.release(0);
        assert_eq!(allocator.free_frames(), 6);
        // Frames 0-2 are free again, 3-4 are still held.
        assert_eq!(allocator.allocate(3), Some(0));
        assert_eq!(allocator.allocate(4), None);
    }

    #[test]
    fn reserved_frames_are_never_handed_out() {
        let allocator = CoreMapAllocator::<FirstFit>::new(4);
        allocator.reserve(0..2);
        assert_eq!(allocator.allocate(1), Some(2));
        assert_eq!(allocator.allocate(1), Some(3));
        assert_eq!(allocator.allocate(1), None);
    }

    #[test]
    fn inactive_allocator_refuses() {
        let allocator = CoreMapAllocator::<NextFit>::new(4);
        assert!(allocator.is_active());
        allocator.deactivate();
        assert!(!allocator.is_active());
        assert_eq!(allocator.allocate(1), None);
    }

    #[test]
    #[should_panic]
    fn double_release_panics() {
        let allocator = CoreMapAllocator::<NextFit>::new(4);
        let frame = allocator.allocate(1).expect("frame available");
        allocator.release(frame);
        allocator.release(frame);
    }
}
