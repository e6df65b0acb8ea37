use alloc::{boxed::Box, vec};
use core::ptr::NonNull;
use core::slice;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// Direct-mapped view of physical memory, one page per frame number.
///
/// The VM subsystem hands out exclusive ownership of individual frames
/// (through the page table), so access to a frame's bytes is `unsafe` and the
/// caller promises it is the frame's current owner.
pub struct PhysicalMemory {
    start: NonNull<u8>,
    frames: usize,
    owned: bool,
}

// SAFETY: the memory is only reached through `frame`/`frame_mut`, whose
// callers guarantee exclusive ownership of the frame they touch.
unsafe impl Send for PhysicalMemory {}
unsafe impl Sync for PhysicalMemory {}

impl PhysicalMemory {
    /// # Safety
    ///
    /// `start + frames * PAGE_FRAME_SIZE` is within bounds, page aligned, and
    /// the region outlives the returned value.
    pub unsafe fn from_raw(start: NonNull<u8>, frames: usize) -> Self {
        Self {
            start,
            frames,
            owned: false,
        }
    }

    /// Heap-backed memory, for hosted builds and tests.
    pub fn new_boxed(frames: usize) -> Self {
        let region: Box<[u8]> = vec![0u8; frames * PAGE_FRAME_SIZE].into_boxed_slice();
        let start = NonNull::from(Box::leak(region)).cast::<u8>();
        Self {
            start,
            frames,
            owned: true,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    fn frame_ptr(&self, frame: usize) -> *mut u8 {
        assert!(
            frame < self.frames,
            "frame {} out of range ({} frames)",
            frame,
            self.frames
        );
        // SAFETY: bounds checked above.
        unsafe { self.start.as_ptr().add(frame * PAGE_FRAME_SIZE) }
    }

    /// # Safety
    ///
    /// No one may be writing `frame` for the lifetime of the returned slice.
    pub unsafe fn frame(&self, frame: usize) -> &[u8] {
        slice::from_raw_parts(self.frame_ptr(frame), PAGE_FRAME_SIZE)
    }

    /// # Safety
    ///
    /// The caller owns `frame` and holds no other reference into it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_mut(&self, frame: usize) -> &mut [u8] {
        slice::from_raw_parts_mut(self.frame_ptr(frame), PAGE_FRAME_SIZE)
    }

    /// Zero memory, to prevent data from being leaked between processes.
    ///
    /// # Safety
    ///
    /// Same as [`PhysicalMemory::frame_mut`].
    pub unsafe fn zero(&self, frame: usize) {
        self.frame_ptr(frame).write_bytes(0, PAGE_FRAME_SIZE);
    }
}

impl Drop for PhysicalMemory {
    fn drop(&mut self) {
        if self.owned {
            let region =
                NonNull::slice_from_raw_parts(self.start, self.frames * PAGE_FRAME_SIZE).as_ptr();
            // SAFETY: produced by Box::leak in new_boxed with this exact length.
            drop(unsafe { Box::from_raw(region) });
        }
    }
}
