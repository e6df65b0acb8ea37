//! Demand paging for user processes.
//!
//! Three caches are kept consistent with each other: the TLB, a global page
//! table indexed by frame, and the swap area. A page lives in exactly one of
//! memory or swap. Lock order is page table before frame allocator; no other
//! locks nest, and none are held across file I/O.

pub mod config;
pub mod error;
pub mod fault;
pub mod page_table;
pub mod stats;
pub mod swap;
pub mod tlb;

pub use config::VmConfig;
pub use error::{Severity, VmError};
pub use fault::{FaultKind, VirtualMemory};
pub use page_table::{PageStatus, PageTable, PageTableEntry};
pub use stats::{VmStats, VmStatsSnapshot};
pub use swap::{FrameGrant, FrameSource, SwapStore};
pub use tlb::{Invalidation, SoftTlb, TlbController, TlbHardware};
