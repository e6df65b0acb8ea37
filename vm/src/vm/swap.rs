//! Swap store: a fixed array of page-sized slots in a backing file.
//!
//! The slot table lock is never held across file I/O. A slot being written or
//! read is `Reserved`, which keeps other swap-outs from claiming it and
//! swap-ins from finding it.

use super::error::{Result, VmError};
use super::page_table::{PageStatus, PageTable};
use super::stats::{Counter, VmStats};
use crate::fs::BackingFile;
use crate::mem::PhysicalMemory;
use crate::sync::Mutex;
use crate::user_program::{AddressSpace, Pid};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use kidneyos_shared::mem::{page_round_down, PAGE_FRAME_SIZE};
use log::{debug, info, trace, warn};

/// A frame handed to the faulting process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGrant {
    pub frame: usize,
    /// A TLB slot freed up by evicting the frame's previous page.
    pub tlb_hint: Option<usize>,
}

/// Where swap-in gets its frame from.
pub trait FrameSource {
    /// A zeroable frame charged to `space`, evicting one of its own pages if needed.
    fn acquire(&self, space: &AddressSpace) -> Result<FrameGrant>;

    /// Give back a frame from [`FrameSource::acquire`] that will not be mapped.
    fn abandon(&self, space: &AddressSpace, grant: FrameGrant);
}

#[derive(Debug, Clone, Copy)]
enum SwapSlot {
    Free,
    Reserved,
    Valid {
        pid: Pid,
        vaddr: usize,
        status: PageStatus,
    },
}

impl SwapSlot {
    fn holds(&self, pid: Pid, vaddr: usize) -> bool {
        matches!(*self, SwapSlot::Valid { pid: p, vaddr: v, .. } if p == pid && v == vaddr)
    }
}

pub struct SwapStore {
    file: Arc<dyn BackingFile>,
    memory: Arc<PhysicalMemory>,
    page_table: Arc<PageTable>,
    slots: Mutex<Box<[SwapSlot]>>,
    stats: Arc<VmStats>,
}

fn slot_offset(slot: usize) -> u64 {
    (slot * PAGE_FRAME_SIZE) as u64
}

impl SwapStore {
    /// Take over `file` as a swap area of `size` bytes, growing it with zero
    /// pages if it is too short.
    pub fn bootstrap(
        file: Arc<dyn BackingFile>,
        size: usize,
        memory: Arc<PhysicalMemory>,
        page_table: Arc<PageTable>,
        stats: Arc<VmStats>,
    ) -> Result<Self> {
        let slot_count = size / PAGE_FRAME_SIZE;
        if slot_count == 0 {
            return Err(VmError::BootstrapFailed);
        }
        let wanted = slot_offset(slot_count);

        if file.size() < wanted {
            let zeroes = [0u8; PAGE_FRAME_SIZE];
            let first =
                usize::try_from(file.size()).map_or(slot_count, |size| size / PAGE_FRAME_SIZE);
            for slot in first..slot_count {
                match file.write_at(slot_offset(slot), &zeroes) {
                    Ok(written) if written == PAGE_FRAME_SIZE => {}
                    Ok(written) => {
                        warn!("swap: short write extending swap file ({written} bytes)");
                        break;
                    }
                    Err(err) => {
                        warn!("swap: extending swap file: {err}");
                        break;
                    }
                }
            }
            if file.size() < wanted {
                return Err(VmError::SwapTooSmall);
            }
        }

        info!("swap: {slot_count} slots ({} KB)", wanted / 1024);
        Ok(Self {
            file,
            memory,
            page_table,
            slots: Mutex::new(vec![SwapSlot::Free; slot_count].into_boxed_slice()),
            stats,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn valid_slots(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|slot| matches!(slot, SwapSlot::Valid { .. }))
            .count()
    }

    /// Whether a swapped copy of `vaddr` exists for `pid`.
    pub fn contains(&self, pid: Pid, vaddr: usize) -> bool {
        let page = page_round_down(vaddr);
        self.slots.lock().iter().any(|slot| slot.holds(pid, page))
    }

    fn reserve_free(&self) -> Result<usize> {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter()
            .position(|slot| matches!(slot, SwapSlot::Free))
            .ok_or(VmError::SwapExhausted)?;
        slots[slot] = SwapSlot::Reserved;
        Ok(slot)
    }

    /// Write `frame`, which holds `vaddr` for `pid`, to a free slot and drop
    /// it from the page table. Returns the slot.
    ///
    /// The frame is left to the caller. Fails with [`VmError::VictimLost`] if
    /// the frame was taken away from `pid` while it was being written.
    pub fn swap_out(
        &self,
        pid: Pid,
        vaddr: usize,
        status: PageStatus,
        frame: usize,
    ) -> Result<usize> {
        let page = page_round_down(vaddr);
        let slot = self.reserve_free()?;

        // SAFETY: the frame belongs to `pid`, whose only faulting thread is
        // the caller, and its TLB mapping has been dropped.
        let data = unsafe { self.memory.frame(frame) };
        if let Err(err) = self.file.write_all_at(slot_offset(slot), data) {
            self.slots.lock()[slot] = SwapSlot::Free;
            return Err(err.into());
        }

        self.slots.lock()[slot] = SwapSlot::Valid {
            pid,
            vaddr: page,
            status: status.with_swapped(true).with_cached(false),
        };

        if !self.page_table.reset_if_owned(frame, pid, page) {
            // The process was torn down under us.
            let mut slots = self.slots.lock();
            if slots[slot].holds(pid, page) {
                slots[slot] = SwapSlot::Free;
            }
            warn!("swap: frame {frame} left pid {pid} during swap-out");
            return Err(VmError::VictimLost);
        }

        self.stats.increment(Counter::SwapOuts);
        debug!("swap: pid {pid} {page:#x} frame {frame} -> slot {slot}");
        Ok(slot)
    }

    /// Bring `vaddr` back from swap into a frame from `source`.
    ///
    /// Returns `Ok(None)` if the page is not in swap.
    pub fn swap_in(
        &self,
        space: &AddressSpace,
        vaddr: usize,
        source: &dyn FrameSource,
    ) -> Result<Option<(FrameGrant, PageStatus)>> {
        let pid = space.pid();
        let page = page_round_down(vaddr);

        let (slot, stored) = {
            let mut slots = self.slots.lock();
            let found = slots.iter().enumerate().find_map(|(slot, entry)| match *entry {
                SwapSlot::Valid { status, .. } if entry.holds(pid, page) => Some((slot, status)),
                _ => None,
            });
            let Some((slot, status)) = found else {
                return Ok(None);
            };
            slots[slot] = SwapSlot::Reserved;
            (slot, status)
        };
        let restore = || {
            self.slots.lock()[slot] = SwapSlot::Valid {
                pid,
                vaddr: page,
                status: stored,
            };
        };

        let grant = match source.acquire(space) {
            Ok(grant) => grant,
            Err(err) => {
                restore();
                return Err(err);
            }
        };

        // SAFETY: the grant gives us sole ownership of the frame.
        let read = unsafe {
            self.memory.zero(grant.frame);
            self.file
                .read_exact_at(slot_offset(slot), self.memory.frame_mut(grant.frame))
        };
        if let Err(err) = read {
            restore();
            source.abandon(space, grant);
            return Err(err.into());
        }

        let status = PageStatus::resident(stored.writable());
        self.page_table.insert(pid, page, grant.frame, status);
        self.slots.lock()[slot] = SwapSlot::Free;

        debug!("swap: pid {pid} {page:#x} slot {slot} -> frame {}", grant.frame);
        Ok(Some((grant, status)))
    }

    /// Free every slot held by `pid`. Returns how many were freed.
    pub fn release_all(&self, pid: Pid) -> usize {
        let mut released = 0;
        for slot in self.slots.lock().iter_mut() {
            if matches!(*slot, SwapSlot::Valid { pid: owner, .. } if owner == pid) {
                *slot = SwapSlot::Free;
                released += 1;
            }
        }
        if released > 0 {
            trace!("swap: released {released} slots of pid {pid}");
        }
        released
    }

    pub fn teardown(&self) {
        let valid = self.valid_slots();
        if valid > 0 {
            warn!("swap: {valid} slots still in use at shutdown");
        }
        info!("swap: shut down");
    }
}
