//! Global inverted page table: one entry per physical frame.

use crate::mem::FrameAllocator;
use crate::sync::Mutex;
use crate::user_program::Pid;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use arbitrary_int::u6;
use bitbybit::bitfield;
use core::fmt;
use kidneyos_shared::mem::page_round_down;
use log::trace;

#[bitfield(u16, default = 0)]
pub struct PageStatus {
    #[bit(0, rw)]
    read_only: bool,
    #[bit(1, rw)]
    dirty: bool,
    /// Set in statuses carried by swap slots.
    #[bit(2, rw)]
    swapped: bool,
    #[bit(3, rw)]
    cached: bool,
    #[bits(4..=9, rw)]
    tlb_slot: u6,
}

impl PageStatus {
    pub fn resident(writable: bool) -> Self {
        Self::DEFAULT.with_read_only(!writable)
    }

    pub fn writable(&self) -> bool {
        !self.read_only()
    }

    /// The TLB slot last programmed for this page. Only meaningful while resident.
    pub fn cached_slot(&self) -> Option<usize> {
        (self.cached() && !self.swapped()).then(|| usize::from(self.tlb_slot().value()))
    }

    pub fn with_cached_slot(self, slot: usize) -> Self {
        // Slot indices are bounded by the 64-entry TLB.
        #[allow(clippy::cast_possible_truncation)]
        let slot = u6::new(slot as u8);
        self.with_cached(true).with_tlb_slot(slot)
    }
}

impl fmt::Debug for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStatus")
            .field("read_only", &self.read_only())
            .field("dirty", &self.dirty())
            .field("swapped", &self.swapped())
            .field("cached_slot", &self.cached_slot())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageTableEntry {
    /// `None` if the frame is free for the taking.
    pub owner: Option<Pid>,
    pub vaddr: usize,
    pub status: PageStatus,
    /// Position in the owner's FIFO. Age 0 is evicted first.
    pub age: usize,
}

impl PageTableEntry {
    const UNOWNED: Self = Self {
        owner: None,
        vaddr: 0,
        status: PageStatus::DEFAULT,
        age: 0,
    };

    fn is_owned_by(&self, pid: Pid) -> bool {
        self.owner == Some(pid)
    }
}

pub struct PageTable {
    entries: Mutex<Box<[PageTableEntry]>>,
    frames: Arc<dyn FrameAllocator>,
}

impl PageTable {
    pub fn new(frame_count: usize, frames: Arc<dyn FrameAllocator>) -> Self {
        Self {
            entries: Mutex::new(vec![PageTableEntry::UNOWNED; frame_count].into_boxed_slice()),
            frames,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn lookup(&self, pid: Pid, vaddr: usize) -> Option<(usize, PageStatus)> {
        let page = page_round_down(vaddr);
        self.entries
            .lock()
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.is_owned_by(pid) && entry.vaddr == page)
            .map(|(frame, entry)| (frame, entry.status))
    }

    pub fn entry(&self, frame: usize) -> PageTableEntry {
        self.entries.lock()[frame]
    }

    /// Record that `frame` backs `vaddr` for `pid`, as the newest of its pages.
    pub fn insert(&self, pid: Pid, vaddr: usize, frame: usize, status: PageStatus) {
        let page = page_round_down(vaddr);
        let mut entries = self.entries.lock();
        assert!(
            entries[frame].owner.is_none(),
            "frame {frame} is already mapped"
        );

        let age = entries
            .iter()
            .filter(|entry| entry.is_owned_by(pid))
            .map(|entry| entry.age + 1)
            .max()
            .unwrap_or(0);

        entries[frame] = PageTableEntry {
            owner: Some(pid),
            vaddr: page,
            status,
            age,
        };
        trace!("pt: pid {pid} {page:#x} -> frame {frame} (age {age})");
    }

    /// The oldest resident page of `pid`.
    pub fn select_victim(&self, pid: Pid) -> Option<(usize, PageTableEntry)> {
        self.entries
            .lock()
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.is_owned_by(pid) && entry.age == 0)
            .map(|(frame, entry)| (frame, *entry))
    }

    /// Clear the entry for `frame`, closing the gap in its owner's ages.
    /// The frame itself is not released.
    pub fn reset(&self, frame: usize) {
        Self::reset_locked(&mut self.entries.lock(), frame);
    }

    fn reset_locked(entries: &mut [PageTableEntry], frame: usize) {
        let removed = entries[frame];
        entries[frame] = PageTableEntry::UNOWNED;
        let Some(pid) = removed.owner else {
            return;
        };
        for entry in entries.iter_mut() {
            if entry.is_owned_by(pid) && entry.age > removed.age {
                entry.age -= 1;
            }
        }
    }

    /// Like [`PageTable::reset`], but only if `frame` still maps `vaddr` for `pid`.
    pub fn reset_if_owned(&self, frame: usize, pid: Pid, vaddr: usize) -> bool {
        let mut entries = self.entries.lock();
        let entry = &entries[frame];
        if !entry.is_owned_by(pid) || entry.vaddr != page_round_down(vaddr) {
            return false;
        }
        Self::reset_locked(&mut entries, frame);
        true
    }

    /// Reset every entry of `pid` and hand its frames back to the allocator.
    /// Returns the number of frames released.
    pub fn remove_all(&self, pid: Pid) -> usize {
        let mut entries = self.entries.lock();
        let mut released = 0;
        for (frame, entry) in entries.iter_mut().enumerate() {
            if entry.is_owned_by(pid) {
                *entry = PageTableEntry::UNOWNED;
                self.frames.release(frame);
                released += 1;
            }
        }
        released
    }

    pub fn set_cached_slot(&self, frame: usize, slot: usize) {
        let mut entries = self.entries.lock();
        let entry = &mut entries[frame];
        entry.status = entry.status.with_cached_slot(slot);
    }

    /// Frames currently owned by `pid`, with their entries.
    pub fn entries_of(&self, pid: Pid) -> Vec<(usize, PageTableEntry)> {
        self.entries
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_owned_by(pid))
            .map(|(frame, entry)| (frame, *entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::frame_allocator::FirstFit;
    use crate::mem::CoreMapAllocator;
    use kidneyos_shared::mem::PAGE_FRAME_SIZE;

    fn table(frames: usize) -> (PageTable, Arc<CoreMapAllocator<FirstFit>>) {
        let allocator = Arc::new(CoreMapAllocator::<FirstFit>::new(frames));
        (PageTable::new(frames, allocator.clone()), allocator)
    }

    fn sorted_ages(table: &PageTable, pid: Pid) -> Vec<usize> {
        let mut ages: Vec<_> = table
            .entries_of(pid)
            .into_iter()
            .map(|(_, entry)| entry.age)
            .collect();
        ages.sort_unstable();
        ages
    }

    #[test]
    fn ages_stay_dense() {
        let (table, _) = table(8);
        for (i, frame) in [3, 0, 5, 6].into_iter().enumerate() {
            table.insert(1, i * PAGE_FRAME_SIZE, frame, PageStatus::resident(true));
        }
        table.insert(2, 0, 7, PageStatus::resident(true));
        assert_eq!(sorted_ages(&table, 1), [0, 1, 2, 3]);
        assert_eq!(table.entry(7).age, 0);

        // Remove from the middle, then the oldest.
        table.reset(5);
        assert_eq!(sorted_ages(&table, 1), [0, 1, 2]);
        let (victim, entry) = table.select_victim(1).expect("victim");
        assert_eq!((victim, entry.vaddr), (3, 0));
        table.reset(victim);
        assert_eq!(sorted_ages(&table, 1), [0, 1]);
        assert_eq!(table.select_victim(1).map(|(frame, _)| frame), Some(0));

        // Other processes are untouched.
        assert_eq!(table.entry(7).age, 0);
        assert!(table.select_victim(9).is_none());
    }

    #[test]
    fn lookup_matches_pid_and_page() {
        let (table, _) = table(4);
        table.insert(1, 0x0040_0000, 2, PageStatus::resident(false));
        let (frame, status) = table.lookup(1, 0x0040_0abc).expect("hit");
        assert_eq!(frame, 2);
        assert!(!status.writable());
        assert!(table.lookup(2, 0x0040_0000).is_none());
        assert!(table.lookup(1, 0x0040_1000).is_none());
    }

    #[test]
    fn reset_if_owned_checks_identity() {
        let (table, _) = table(4);
        table.insert(1, 0x1000, 0, PageStatus::resident(true));
        assert!(!table.reset_if_owned(0, 2, 0x1000));
        assert!(!table.reset_if_owned(0, 1, 0x2000));
        assert!(table.reset_if_owned(0, 1, 0x1000));
        assert!(table.entry(0).owner.is_none());
        assert!(!table.reset_if_owned(0, 1, 0x1000));
    }

    #[test]
    fn remove_all_releases_frames() {
        let (table, allocator) = table(4);
        for vaddr in [0x1000, 0x2000] {
            let frame = allocator.allocate(1).expect("frame");
            table.insert(4, vaddr, frame, PageStatus::resident(true));
        }
        let other = allocator.allocate(1).expect("frame");
        table.insert(5, 0x1000, other, PageStatus::resident(true));
        assert_eq!(allocator.free_frames(), 1);

        assert_eq!(table.remove_all(4), 2);
        assert_eq!(allocator.free_frames(), 3);
        assert!(table.entries_of(4).is_empty());
        assert_eq!(table.entries_of(5).len(), 1);
    }

    #[test]
    fn cached_slot_only_while_resident() {
        let status = PageStatus::resident(true).with_cached_slot(63);
        assert_eq!(status.cached_slot(), Some(63));
        assert_eq!(status.with_swapped(true).cached_slot(), None);
        assert_eq!(PageStatus::resident(true).cached_slot(), None);
    }
}
