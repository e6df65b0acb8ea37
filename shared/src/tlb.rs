// MIPS-style software-managed TLB entry layout.
//
//  <----------------20------------------->|<----6---->|<----6---->|
//  |           Virtual Page Number         |   ASID    |     0     |  EntryHi
//  |            Page Frame Number          |N|D|V|G|       0       |  EntryLo

// Page and frame numbers never exceed 20 bits on the 32-bit user address
// space, so the usize -> u32 casts below cannot truncate a valid input.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::{OFFSET, PAGE_FRAME_SIZE};
use arbitrary_int::{u20, u6};
use bitbybit::bitfield;
use core::fmt;

const PAGE_SHIFT: usize = 12;
const VPN_MASK: usize = 0xF_FFFF;

/// Number of distinct address-space tags the hardware can hold.
pub const ASID_COUNT: u16 = 64;

#[bitfield(u32, default = 0)]
pub struct EntryHi {
    #[bits(12..=31, rw)]
    vpn: u20,
    #[bits(6..=11, rw)]
    asid: u6,
}

#[bitfield(u32, default = 0)]
pub struct EntryLo {
    #[bits(12..=31, rw)]
    pfn: u20,
    #[bit(11, rw)]
    no_cache: bool,
    /// Write enable. A store through an entry without it raises a read-only fault.
    #[bit(10, rw)]
    dirty: bool,
    #[bit(9, rw)]
    valid: bool,
    #[bit(8, rw)]
    global: bool,
}

/// Hardware tag for a process. Only the low six bits of the pid survive.
#[inline]
pub const fn asid_of(pid: u16) -> u8 {
    (pid % ASID_COUNT) as u8
}

impl EntryHi {
    pub fn for_page(vaddr: usize, pid: u16) -> Self {
        Self::DEFAULT
            .with_vpn(u20::new(((vaddr >> PAGE_SHIFT) & VPN_MASK) as u32))
            .with_asid(u6::new(asid_of(pid)))
    }

    /// A tag that can never match a user page: a distinct kernel page per slot,
    /// so that no two invalidated slots collide on a probe.
    pub fn invalid(index: usize) -> Self {
        Self::DEFAULT.with_vpn(u20::new((((OFFSET / PAGE_FRAME_SIZE) + index) & VPN_MASK) as u32))
    }

    pub fn page(&self) -> usize {
        (self.vpn().value() as usize) << PAGE_SHIFT
    }

    pub fn tag(&self) -> u8 {
        self.asid().value()
    }
}

impl EntryLo {
    pub fn for_frame(frame: usize, writable: bool) -> Self {
        Self::DEFAULT
            .with_pfn(u20::new((frame & VPN_MASK) as u32))
            .with_dirty(writable)
            .with_valid(true)
    }

    pub fn frame(&self) -> usize {
        self.pfn().value() as usize
    }
}

impl fmt::Debug for EntryHi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHi")
            .field("page", &format_args!("{:#x}", self.page()))
            .field("asid", &self.tag())
            .finish()
    }
}

impl fmt::Debug for EntryLo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryLo")
            .field("frame", &self.frame())
            .field("dirty", &self.dirty())
            .field("valid", &self.valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_hi_layout() {
        let hi = EntryHi::for_page(0x0040_3000, 5);
        assert_eq!(hi.raw_value(), 0x0040_3000 | (5 << 6));
        assert_eq!(hi.page(), 0x0040_3000);
        assert_eq!(hi.tag(), 5);
    }

    #[test]
    fn pid_is_truncated_to_asid() {
        assert_eq!(EntryHi::for_page(0x1000, 65).tag(), 1);
    }

    #[test]
    fn entry_lo_layout() {
        let lo = EntryLo::for_frame(7, true);
        assert_eq!(lo.raw_value(), (7 << 12) | (1 << 10) | (1 << 9));
        assert_eq!(lo.frame(), 7);
        assert!(!EntryLo::for_frame(7, false).dirty());
    }

    #[test]
    fn invalid_tags_are_distinct_kernel_pages() {
        let a = EntryHi::invalid(0);
        let b = EntryHi::invalid(1);
        assert_ne!(a.raw_value(), b.raw_value());
        assert!(a.page() >= OFFSET);
        assert!(!EntryLo::DEFAULT.valid());
    }
}
