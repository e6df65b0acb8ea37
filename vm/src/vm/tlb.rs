//! Translation cache controller for a software-managed TLB.
//!
//! The hardware only tags entries with the low six bits of the pid, so the
//! controller keeps the full owner of every slot alongside it. A slot is
//! occupied iff it has an owner.

use super::stats::{Counter, VmStats};
use crate::sync::Mutex;
use crate::user_program::Pid;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use kidneyos_shared::tlb::{EntryHi, EntryLo};
use log::trace;

/// The TLB as seen by software.
pub trait TlbHardware: Send + Sync {
    fn slot_count(&self) -> usize;
    fn write(&self, index: usize, hi: EntryHi, lo: EntryLo);
    fn read(&self, index: usize) -> (EntryHi, EntryLo);
    /// Index of the valid entry matching `hi`, if any.
    fn probe(&self, hi: EntryHi) -> Option<usize>;
}

/// A TLB modelled in memory.
pub struct SoftTlb {
    entries: Mutex<Box<[(EntryHi, EntryLo)]>>,
}

impl SoftTlb {
    pub fn new(slots: usize) -> Self {
        Self {
            entries: Mutex::new(
                (0..slots)
                    .map(|index| (EntryHi::invalid(index), EntryLo::DEFAULT))
                    .collect(),
            ),
        }
    }
}

impl TlbHardware for SoftTlb {
    fn slot_count(&self) -> usize {
        self.entries.lock().len()
    }

    fn write(&self, index: usize, hi: EntryHi, lo: EntryLo) {
        self.entries.lock()[index] = (hi, lo);
    }

    fn read(&self, index: usize) -> (EntryHi, EntryLo) {
        self.entries.lock()[index]
    }

    fn probe(&self, hi: EntryHi) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|(entry_hi, entry_lo)| {
                entry_hi.raw_value() == hi.raw_value() && entry_lo.valid()
            })
    }
}

/// What [`TlbController::invalidate_other_processes`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// Every occupied slot was dropped.
    Full,
    /// Some slots belonged to the current process and were kept.
    Selective,
    /// Nothing needed dropping.
    Noop,
}

struct TlbState {
    owners: Box<[Option<Pid>]>,
    next_victim: usize,
}

impl TlbState {
    fn round_robin_victim(&mut self) -> usize {
        let victim = self.next_victim;
        self.next_victim = (self.next_victim + 1) % self.owners.len();
        victim
    }
}

pub struct TlbController {
    hardware: Arc<dyn TlbHardware>,
    state: Mutex<TlbState>,
    stats: Arc<VmStats>,
}

impl TlbController {
    /// Take over the first `slots` entries of `hardware`, invalidating them all.
    pub fn new(hardware: Arc<dyn TlbHardware>, slots: usize, stats: Arc<VmStats>) -> Self {
        let slots = slots.min(hardware.slot_count());
        for index in 0..slots {
            hardware.write(index, EntryHi::invalid(index), EntryLo::DEFAULT);
        }
        Self {
            hardware,
            state: Mutex::new(TlbState {
                owners: vec![None; slots].into_boxed_slice(),
                next_victim: 0,
            }),
            stats,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.state.lock().owners.len()
    }

    pub fn occupancy(&self) -> usize {
        self.state
            .lock()
            .owners
            .iter()
            .filter(|owner| owner.is_some())
            .count()
    }

    pub fn slot_owner(&self, slot: usize) -> Option<Pid> {
        self.state.lock().owners.get(slot).copied().flatten()
    }

    /// Program a mapping after a miss, returning the slot used.
    ///
    /// Reuses `hint` if it names a real slot, otherwise the first free slot,
    /// otherwise the next round-robin victim.
    pub fn insert_or_replace(
        &self,
        hint: Option<usize>,
        vaddr: usize,
        pid: Pid,
        frame: usize,
        writable: bool,
    ) -> usize {
        let hi = EntryHi::for_page(vaddr, pid);
        let lo = EntryLo::for_frame(frame, writable);

        let mut state = self.state.lock();
        let slots = state.owners.len();
        // A page must never sit in two slots.
        let existing = self.hardware.probe(hi).filter(|&index| index < slots);
        let free = state.owners.iter().position(Option::is_none);
        let (slot, replaced) = match existing
            .or(hint.filter(|&index| index < slots))
            .or(free)
        {
            Some(slot) => (slot, false),
            None => (state.round_robin_victim(), true),
        };

        self.stats.increment(Counter::TlbFaults);
        self.stats.increment(if replaced {
            Counter::TlbFaultsReplace
        } else {
            Counter::TlbFaultsFree
        });

        self.hardware.write(slot, hi, lo);
        state.owners[slot] = Some(pid);
        trace!("tlb: slot {slot} <- pid {pid} {vaddr:#x} -> frame {frame} (writable {writable})");
        slot
    }

    /// The frame `vaddr` maps to for `pid`, if the TLB holds it.
    pub fn probe(&self, vaddr: usize, pid: Pid) -> Option<usize> {
        let state = self.state.lock();
        let slot = self.hardware.probe(EntryHi::for_page(vaddr, pid))?;
        if state.owners.get(slot).copied().flatten() != Some(pid) {
            return None;
        }
        let (_, lo) = self.hardware.read(slot);
        Some(lo.frame())
    }

    fn clear_slot(&self, state: &mut TlbState, slot: usize) {
        state.owners[slot] = None;
        self.hardware
            .write(slot, EntryHi::invalid(slot), EntryLo::DEFAULT);
    }

    pub fn invalidate_one(&self, slot: usize) {
        let mut state = self.state.lock();
        if slot < state.owners.len() {
            self.clear_slot(&mut state, slot);
        }
    }

    pub fn invalidate_all(&self) {
        let mut state = self.state.lock();
        for slot in 0..state.owners.len() {
            self.clear_slot(&mut state, slot);
        }
        self.stats.increment(Counter::TlbInvalidationsFull);
    }

    /// Drop every occupied slot not owned by `current`. Run on context switch.
    pub fn invalidate_other_processes(&self, current: Pid) -> Invalidation {
        let mut state = self.state.lock();
        let mut dropped = 0;
        let mut kept = 0;
        for slot in 0..state.owners.len() {
            let owner = state.owners[slot];
            match owner {
                Some(owner) if owner == current => kept += 1,
                Some(_) => {
                    self.clear_slot(&mut state, slot);
                    dropped += 1;
                }
                None => {}
            }
        }

        let outcome = match (dropped, kept) {
            (0, _) => Invalidation::Noop,
            (_, 0) => Invalidation::Full,
            _ => Invalidation::Selective,
        };
        self.stats.increment(match outcome {
            Invalidation::Full => Counter::TlbInvalidationsFull,
            Invalidation::Selective => Counter::TlbInvalidationsSelective,
            Invalidation::Noop => Counter::TlbInvalidationsNoop,
        });
        outcome
    }

    /// Drop `slot` only if it still maps `vaddr` for `pid`.
    pub fn invalidate_mapping(&self, slot: usize, vaddr: usize, pid: Pid) -> bool {
        let mut state = self.state.lock();
        if state.owners.get(slot).copied().flatten() != Some(pid) {
            return false;
        }
        let (hi, _) = self.hardware.read(slot);
        if hi.raw_value() != EntryHi::for_page(vaddr, pid).raw_value() {
            return false;
        }
        self.clear_slot(&mut state, slot);
        true
    }

    /// Drop every slot of an exiting process. Returns how many were dropped.
    pub fn invalidate_process(&self, pid: Pid) -> usize {
        let mut state = self.state.lock();
        let mut dropped = 0;
        for slot in 0..state.owners.len() {
            if state.owners[slot] == Some(pid) {
                self.clear_slot(&mut state, slot);
                dropped += 1;
            }
        }
        dropped
    }
}
