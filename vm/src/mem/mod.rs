pub mod frame_allocator;
pub mod phys;

pub use frame_allocator::{AllocError, CoreMapAllocator};
pub use phys::PhysicalMemory;

/// Hands out physical frames by number.
///
/// The page table calls [`FrameAllocator::release`] while holding its own
/// lock, so implementations must not call back into the VM subsystem.
pub trait FrameAllocator: Send + Sync {
    /// Allocate `frames` contiguous frames, returning the first frame number.
    fn allocate(&self, frames: usize) -> Option<usize>;

    /// Release the allocation that starts at `frame`.
    fn release(&self, frame: usize);

    /// Whether the allocator is ready to hand out frames.
    fn is_active(&self) -> bool;
}
