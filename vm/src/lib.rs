#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod fs;
pub mod mem;
pub mod sync;
pub mod user_program;
pub mod vm;

pub use user_program::{AddressSpace, Pid};
pub use vm::{FaultKind, VirtualMemory, VmConfig, VmError};
