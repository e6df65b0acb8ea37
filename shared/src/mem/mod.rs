use crate::sizes::KB;

// Page size is 4KB. Both the MIPS TLB model and x86 paging use it.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;
pub const PAGE_MASK: usize = !(PAGE_FRAME_SIZE - 1);

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// The user stack grows down from the first kernel address.
pub const USER_STACK_TOP: usize = OFFSET;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & PAGE_MASK
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// Number of pages touched by `len` bytes starting `offset` bytes into a page.
#[inline]
pub const fn pages_spanned(offset: usize, len: usize) -> usize {
    (page_offset(offset) + len).div_ceil(PAGE_FRAME_SIZE)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}
