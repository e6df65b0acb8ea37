pub mod addrspace;
pub mod elf;

pub use addrspace::{AddressSpace, AddressSpaceError, ImageSpan, Region, RegionKind};

/// Process identifier. The TLB only sees its low six bits.
pub type Pid = u16;
