use kidneyos_shared::mem::USER_STACK_TOP;
use kidneyos_shared::sizes::SWAP_SIZE;

/// Slots in the hardware TLB.
pub const NUM_TLB: usize = 64;
/// Pages of stack given to every process.
pub const STACK_PAGES: usize = 18;
/// Frames a process may hold before it starts evicting its own pages.
pub const MAX_ALLOCATED_PAGES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub tlb_slots: usize,
    pub max_allocated_pages: usize,
    pub stack_pages: usize,
    pub user_stack_top: usize,
    /// Bytes of swap. Rounded down to whole pages.
    pub swap_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            tlb_slots: NUM_TLB,
            max_allocated_pages: MAX_ALLOCATED_PAGES,
            stack_pages: STACK_PAGES,
            user_stack_top: USER_STACK_TOP,
            swap_size: SWAP_SIZE,
        }
    }
}
