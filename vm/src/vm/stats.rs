//! Event counters for the VM subsystem.
//!
//! Every TLB miss that is resolved is counted exactly once on each side of
//! the two TLB identities below, and every disk fault exactly once as either
//! an image load or a swap-in:
//!
//! ```text
//! tlb_faults = tlb_faults_free + tlb_faults_replace
//! tlb_faults = tlb_reloads + page_faults_disk + page_faults_zeroed
//! page_faults_disk = page_faults_elf + page_faults_swapin
//! ```

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    TlbFaults,
    TlbFaultsFree,
    TlbFaultsReplace,
    TlbInvalidationsFull,
    TlbInvalidationsSelective,
    TlbInvalidationsNoop,
    TlbReloads,
    PageFaultsZeroed,
    PageFaultsDisk,
    PageFaultsElf,
    PageFaultsSwapin,
    SwapOuts,
}

const COUNTERS: usize = Counter::SwapOuts as usize + 1;

#[derive(Debug, Default)]
pub struct VmStats {
    counters: [AtomicUsize; COUNTERS],
}

impl VmStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, counter: Counter) {
        self.counters[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> usize {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> VmStatsSnapshot {
        VmStatsSnapshot {
            tlb_faults: self.get(Counter::TlbFaults),
            tlb_faults_free: self.get(Counter::TlbFaultsFree),
            tlb_faults_replace: self.get(Counter::TlbFaultsReplace),
            tlb_invalidations_full: self.get(Counter::TlbInvalidationsFull),
            tlb_invalidations_selective: self.get(Counter::TlbInvalidationsSelective),
            tlb_invalidations_noop: self.get(Counter::TlbInvalidationsNoop),
            tlb_reloads: self.get(Counter::TlbReloads),
            page_faults_zeroed: self.get(Counter::PageFaultsZeroed),
            page_faults_disk: self.get(Counter::PageFaultsDisk),
            page_faults_elf: self.get(Counter::PageFaultsElf),
            page_faults_swapin: self.get(Counter::PageFaultsSwapin),
            swap_outs: self.get(Counter::SwapOuts),
        }
    }
}

/// A broken counter identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsMismatch {
    FreePlusReplace,
    ReloadsDiskZeroed,
    ElfPlusSwapin,
}

impl fmt::Display for StatsMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FreePlusReplace => {
                write!(f, "TLB faults with free + TLB faults with replace != TLB faults")
            }
            Self::ReloadsDiskZeroed => write!(f, "TLB reloads + PF disk + PF zeroed != TLB faults"),
            Self::ElfPlusSwapin => write!(f, "PF from ELF + PF from swapfile != PF disk"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    pub tlb_faults: usize,
    pub tlb_faults_free: usize,
    pub tlb_faults_replace: usize,
    pub tlb_invalidations_full: usize,
    pub tlb_invalidations_selective: usize,
    pub tlb_invalidations_noop: usize,
    pub tlb_reloads: usize,
    pub page_faults_zeroed: usize,
    pub page_faults_disk: usize,
    pub page_faults_elf: usize,
    pub page_faults_swapin: usize,
    pub swap_outs: usize,
}

impl VmStatsSnapshot {
    pub fn mismatches(&self) -> impl Iterator<Item = StatsMismatch> {
        [
            (
                self.tlb_faults_free + self.tlb_faults_replace != self.tlb_faults,
                StatsMismatch::FreePlusReplace,
            ),
            (
                self.tlb_reloads + self.page_faults_disk + self.page_faults_zeroed
                    != self.tlb_faults,
                StatsMismatch::ReloadsDiskZeroed,
            ),
            (
                self.page_faults_elf + self.page_faults_swapin != self.page_faults_disk,
                StatsMismatch::ElfPlusSwapin,
            ),
        ]
        .into_iter()
        .filter_map(|(broken, mismatch)| broken.then_some(mismatch))
    }

    pub fn is_consistent(&self) -> bool {
        self.mismatches().next().is_none()
    }

    /// Log each broken identity.
    pub fn warn_mismatches(&self) {
        for mismatch in self.mismatches() {
            warn!("vm statistics: {mismatch}");
        }
    }
}

impl fmt::Display for VmStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "STATISTICS:")?;
        writeln!(
            f,
            "tlb_faults={}, tlb_faults_free={}, tlb_faults_replace={}",
            self.tlb_faults, self.tlb_faults_free, self.tlb_faults_replace
        )?;
        writeln!(
            f,
            "tlb_invalidations full={} selective={} noop={}, tlb_reloads={}",
            self.tlb_invalidations_full,
            self.tlb_invalidations_selective,
            self.tlb_invalidations_noop,
            self.tlb_reloads
        )?;
        write!(
            f,
            "page_faults_zeroed={}, page_faults_disk={}, page_faults_elf={}, page_faults_swapin={}, swap_outs={}",
            self.page_faults_zeroed,
            self.page_faults_disk,
            self.page_faults_elf,
            self.page_faults_swapin,
            self.swap_outs
        )?;
        for mismatch in self.mismatches() {
            write!(f, "\nWarning: {mismatch}")?;
        }
        Ok(())
    }
}
