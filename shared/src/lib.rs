#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod logger;
pub mod mem;
pub mod sizes;
pub mod tlb;
