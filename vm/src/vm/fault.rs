use super::config::VmConfig;
use super::error::{Result, Severity, VmError};
use super::page_table::{PageStatus, PageTable};
use super::stats::{Counter, VmStats, VmStatsSnapshot};
use super::swap::{FrameGrant, FrameSource, SwapStore};
use super::tlb::{Invalidation, TlbController, TlbHardware};
use crate::fs::BackingFile;
use crate::mem::{FrameAllocator, PhysicalMemory};
use crate::user_program::{AddressSpace, AddressSpaceError, Pid, RegionKind};
use alloc::sync::Arc;
use kidneyos_shared::mem::{is_user_vaddr, page_round_down};
use kidneyos_shared::tlb::ASID_COUNT;
use log::{debug, error, info, trace, warn};

/// The kind of access that missed in the TLB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// A store hit a valid mapping without write permission.
    ReadOnly,
}

/// The virtual memory subsystem.
pub struct VirtualMemory {
    config: VmConfig,
    memory: Arc<PhysicalMemory>,
    frames: Arc<dyn FrameAllocator>,
    page_table: Arc<PageTable>,
    tlb: TlbController,
    swap: SwapStore,
    stats: Arc<VmStats>,
}

impl VirtualMemory {
    pub fn bootstrap(
        config: VmConfig,
        memory: Arc<PhysicalMemory>,
        frames: Arc<dyn FrameAllocator>,
        tlb_hardware: Arc<dyn TlbHardware>,
        swap_file: Arc<dyn BackingFile>,
    ) -> Result<Self> {
        if config.tlb_slots == 0
            || config.tlb_slots > usize::from(ASID_COUNT)
            || config.tlb_slots > tlb_hardware.slot_count()
        {
            error!(
                "vm: {} TLB slots configured, hardware has {}",
                config.tlb_slots,
                tlb_hardware.slot_count()
            );
            return Err(VmError::BootstrapFailed);
        }
        if config.max_allocated_pages == 0 || !frames.is_active() {
            error!("vm: no frames to hand out");
            return Err(VmError::BootstrapFailed);
        }

        let stats = Arc::new(VmStats::new());
        let page_table = Arc::new(PageTable::new(memory.frame_count(), frames.clone()));
        let tlb = TlbController::new(tlb_hardware, config.tlb_slots, stats.clone());
        let swap = SwapStore::bootstrap(
            swap_file,
            config.swap_size,
            memory.clone(),
            page_table.clone(),
            stats.clone(),
        )?;

        info!(
            "vm: {} frames, {} TLB slots, {} pages per process",
            memory.frame_count(),
            config.tlb_slots,
            config.max_allocated_pages
        );
        Ok(Self {
            config,
            memory,
            frames,
            page_table,
            tlb,
            swap,
            stats,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn tlb(&self) -> &TlbController {
        &self.tlb
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    /// A fresh address space for `pid` with the configured frame ceiling and stack.
    pub fn create_address_space(
        &self,
        pid: Pid,
    ) -> core::result::Result<AddressSpace, AddressSpaceError> {
        let mut space = AddressSpace::new(pid, self.config.max_allocated_pages);
        space.define_stack(self.config.user_stack_top, self.config.stack_pages)?;
        Ok(space)
    }

    /// Resolve a TLB miss at `address` and program the TLB. Returns the frame
    /// now backing the page.
    ///
    /// On a process-fatal error the address space has already been torn down.
    pub fn resolve_fault(
        &self,
        space: &AddressSpace,
        address: usize,
        kind: FaultKind,
    ) -> Result<usize> {
        let result = self.resolve(space, address, kind);
        if let Err(err) = result {
            let pid = space.pid();
            match err.severity() {
                Severity::Process => {
                    error!("vm: pid {pid} at {address:#x} ({kind:?}): {err}");
                    self.destroy_address_space(space);
                }
                Severity::Kernel => error!("vm: fatal fault for pid {pid} at {address:#x}: {err}"),
                Severity::Fault => warn!("vm: pid {pid} at {address:#x}: {err}"),
            }
        }
        result
    }

    fn resolve(&self, space: &AddressSpace, address: usize, kind: FaultKind) -> Result<usize> {
        let pid = space.pid();
        if kind == FaultKind::ReadOnly {
            return Err(VmError::ProtectionViolation);
        }
        if !is_user_vaddr(address) {
            return Err(VmError::SegmentationFault);
        }
        let page = page_round_down(address);

        let resident = self.page_table.lookup(pid, page);
        let (frame, status, hint) = if let Some((frame, status)) = resident {
            trace!("vm: pid {pid} {page:#x} resident in frame {frame}");
            self.stats.increment(Counter::TlbReloads);
            (frame, status, status.cached_slot())
        } else if let Some((grant, status)) = self.swap.swap_in(space, page, self)? {
            self.stats.increment(Counter::PageFaultsDisk);
            self.stats.increment(Counter::PageFaultsSwapin);
            (grant.frame, status, grant.tlb_hint)
        } else {
            self.load_page(space, page)?
        };

        let slot = self
            .tlb
            .insert_or_replace(hint, page, pid, frame, status.writable());
        self.page_table.set_cached_slot(frame, slot);
        Ok(frame)
    }

    /// First touch of a page: zero-fill it or read it from the program image.
    fn load_page(
        &self,
        space: &AddressSpace,
        page: usize,
    ) -> Result<(usize, PageStatus, Option<usize>)> {
        let pid = space.pid();
        let region = space.region_at(page).ok_or(VmError::SegmentationFault)?;
        let grant = self.acquire(space)?;

        // SAFETY: the grant gives us sole ownership of the frame.
        unsafe { self.memory.zero(grant.frame) };

        let span = match (region.kind(), space.image()) {
            (RegionKind::Stack, _) | (_, None) => None,
            (_, Some(image)) => region.image_span(page).map(|span| (image, span)),
        };
        if let Some((image, span)) = span {
            // SAFETY: as above.
            let frame = unsafe { self.memory.frame_mut(grant.frame) };
            let dest = &mut frame[span.frame_offset..span.frame_offset + span.len];
            if let Err(err) = image.read_exact_at(span.file_offset, dest) {
                self.abandon(space, grant);
                return Err(err.into());
            }
            self.stats.increment(Counter::PageFaultsDisk);
            self.stats.increment(Counter::PageFaultsElf);
            debug!(
                "vm: pid {pid} {page:#x} loaded {} bytes from image offset {:#x}",
                span.len, span.file_offset
            );
        } else {
            self.stats.increment(Counter::PageFaultsZeroed);
            trace!("vm: pid {pid} {page:#x} zero-filled");
        }

        let status = PageStatus::resident(region.kind().writable());
        self.page_table.insert(pid, page, grant.frame, status);
        Ok((grant.frame, status, grant.tlb_hint))
    }

    /// Swap out the oldest page of `space` and hand its frame over.
    fn evict_local(&self, space: &AddressSpace) -> Result<FrameGrant> {
        let pid = space.pid();
        let (frame, victim) = self.page_table.select_victim(pid).ok_or(VmError::NoVictim)?;

        let tlb_hint = victim
            .status
            .cached_slot()
            .filter(|&slot| self.tlb.invalidate_mapping(slot, victim.vaddr, pid));
        self.swap.swap_out(pid, victim.vaddr, victim.status, frame)?;

        debug!("vm: pid {pid} evicted {:#x} from frame {frame}", victim.vaddr);
        Ok(FrameGrant { frame, tlb_hint })
    }

    /// Context switch to `space`: drop every TLB entry of other processes.
    pub fn activate(&self, space: &AddressSpace) -> Invalidation {
        self.tlb.invalidate_other_processes(space.pid())
    }

    /// Release everything `space` holds: frames, TLB entries and swap slots.
    pub fn destroy_address_space(&self, space: &AddressSpace) {
        let pid = space.pid();
        let frames = self.page_table.remove_all(pid);
        let tlb_slots = self.tlb.invalidate_process(pid);
        let swap_slots = self.swap.release_all(pid);
        space.reset_frames();
        info!(
            "vm: pid {pid} released {frames} frames, {tlb_slots} TLB slots, {swap_slots} swap slots"
        );
    }

    pub fn stats(&self) -> VmStatsSnapshot {
        self.stats.snapshot()
    }

    /// Shut the subsystem down, reporting the final statistics.
    pub fn teardown(self) -> VmStatsSnapshot {
        let snapshot = self.stats.snapshot();
        self.swap.teardown();
        info!("vm: {snapshot}");
        snapshot.warn_mismatches();
        snapshot
    }
}

impl FrameSource for VirtualMemory {
    fn acquire(&self, space: &AddressSpace) -> Result<FrameGrant> {
        if space.try_charge_frame() {
            if let Some(frame) = self.frames.allocate(1) {
                return Ok(FrameGrant {
                    frame,
                    tlb_hint: None,
                });
            }
            space.uncharge_frame();
        }
        self.evict_local(space)
    }

    fn abandon(&self, space: &AddressSpace, grant: FrameGrant) {
        self.frames.release(grant.frame);
        space.uncharge_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileError, MemFile};
    use crate::mem::frame_allocator::NextFit;
    use crate::mem::CoreMapAllocator;
    use crate::sync::Mutex;
    use crate::user_program::elf::test_image::{build, Segment};
    use crate::vm::tlb::SoftTlb;
    use kidneyos_shared::mem::{PAGE_FRAME_SIZE, USER_STACK_TOP};
    use std::thread;

    const PAGE: usize = PAGE_FRAME_SIZE;

    /// Records every read so tests can tell when the disk was touched.
    struct CountingFile {
        inner: MemFile,
        reads: Mutex<Vec<(u64, usize)>>,
    }

    impl CountingFile {
        fn new(bytes: Vec<u8>) -> Self {
            Self {
                inner: MemFile::from_bytes(bytes),
                reads: Mutex::new(Vec::new()),
            }
        }

        fn reads(&self) -> Vec<(u64, usize)> {
            self.reads.lock().clone()
        }
    }

    impl BackingFile for CountingFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> crate::fs::Result<usize> {
            self.reads.lock().push((offset, buf.len()));
            self.inner.read_at(offset, buf)
        }

        fn write_at(&self, offset: u64, buf: &[u8]) -> crate::fs::Result<usize> {
            self.inner.write_at(offset, buf)
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }
    }

    struct Harness {
        vm: VirtualMemory,
        frames: Arc<CoreMapAllocator<NextFit>>,
    }

    fn config(max_allocated_pages: usize) -> VmConfig {
        VmConfig {
            tlb_slots: 8,
            max_allocated_pages,
            swap_size: 128 * PAGE,
            ..VmConfig::default()
        }
    }

    fn boot(frame_count: usize, config: VmConfig) -> Harness {
        // Only the first test to get here installs the logger.
        let _ = kidneyos_shared::logger::init(log::LevelFilter::Debug);
        let memory = Arc::new(PhysicalMemory::new_boxed(frame_count));
        let frames = Arc::new(CoreMapAllocator::<NextFit>::new(frame_count));
        let vm = VirtualMemory::bootstrap(
            config,
            memory,
            frames.clone(),
            Arc::new(SoftTlb::new(64)),
            Arc::new(MemFile::new()),
        )
        .expect("bootstrap");
        Harness { vm, frames }
    }

    fn stack_page(n: usize) -> usize {
        USER_STACK_TOP - (n + 1) * PAGE
    }

    fn frame_bytes(vm: &VirtualMemory, frame: usize) -> &[u8] {
        unsafe { vm.memory.frame(frame) }
    }

    fn fill_frame(vm: &VirtualMemory, frame: usize, byte: u8) {
        unsafe { vm.memory.frame_mut(frame).fill(byte) };
    }

    #[test]
    fn rejects_bad_configuration() {
        for tlb_slots in [0, 65] {
            let result = VirtualMemory::bootstrap(
                VmConfig {
                    tlb_slots,
                    ..config(4)
                },
                Arc::new(PhysicalMemory::new_boxed(4)),
                Arc::new(CoreMapAllocator::<NextFit>::new(4)),
                Arc::new(SoftTlb::new(64)),
                Arc::new(MemFile::new()),
            );
            assert!(matches!(result, Err(VmError::BootstrapFailed)));
        }

        let swap = MemFile::with_capacity_limit(PAGE);
        let result = VirtualMemory::bootstrap(
            config(4),
            Arc::new(PhysicalMemory::new_boxed(4)),
            Arc::new(CoreMapAllocator::<NextFit>::new(4)),
            Arc::new(SoftTlb::new(64)),
            Arc::new(swap),
        );
        assert!(matches!(result, Err(VmError::SwapTooSmall)));
    }

    #[test]
    fn short_code_segment_mid_page() {
        let h = boot(8, config(4));
        let data: Vec<u8> = (1..=10).collect();
        let image = Arc::new(CountingFile::new(build(
            0x0040_0064,
            &[Segment {
                vaddr: 0x0040_0064,
                offset: 100,
                data: &data,
                memory_size: 10,
                flags: 5,
            }],
        )));
        let mut space = h.vm.create_address_space(1).expect("address space");
        space.load_elf(image.clone()).expect("load");
        let header_reads = image.reads().len();

        let frame = h
            .vm
            .resolve_fault(&space, 0x0040_0064, FaultKind::Read)
            .expect("fault");
        assert_eq!(&image.reads()[header_reads..], [(100, 10)]);

        let bytes = frame_bytes(&h.vm, frame);
        assert_eq!(&bytes[100..110], &data[..]);
        assert!(bytes[..100].iter().all(|&b| b == 0));
        assert!(bytes[110..].iter().all(|&b| b == 0));

        let stats = h.vm.stats();
        assert_eq!(stats.page_faults_elf, 1);
        assert_eq!(stats.page_faults_disk, 1);
        assert!(stats.is_consistent());
    }

    #[test]
    fn whole_page_segment_reads_full_last_page() {
        let h = boot(8, config(4));
        let data = vec![0xC3; 2 * PAGE];
        let image = Arc::new(CountingFile::new(build(
            0x0040_0000,
            &[Segment {
                vaddr: 0x0040_0000,
                offset: 0x1000,
                data: &data,
                memory_size: 3 * PAGE as u32,
                flags: 5,
            }],
        )));
        let mut space = h.vm.create_address_space(1).expect("address space");
        space.load_elf(image.clone()).expect("load");
        let header_reads = image.reads().len();

        let frame = h
            .vm
            .resolve_fault(&space, 0x0040_1010, FaultKind::Read)
            .expect("fault");
        assert_eq!(&image.reads()[header_reads..], [(0x2000, PAGE)]);
        assert!(frame_bytes(&h.vm, frame).iter().all(|&b| b == 0xC3));

        // Past the end of the file image the page is zero-filled.
        let frame = h
            .vm
            .resolve_fault(&space, 0x0040_2000, FaultKind::Read)
            .expect("fault");
        assert_eq!(image.reads().len(), header_reads + 1);
        assert!(frame_bytes(&h.vm, frame).iter().all(|&b| b == 0));
        assert_eq!(h.vm.stats().page_faults_zeroed, 1);
    }

    #[test]
    fn hand_defined_region_loads_from_its_image() {
        let h = boot(4, config(4));
        let mut space = h.vm.create_address_space(1).expect("address space");
        space
            .define_region(0x0040_0000, PAGE, 0, 16)
            .expect("region");
        space.set_image(Arc::new(MemFile::from_bytes(vec![0x42; 16])));

        let frame = h
            .vm
            .resolve_fault(&space, 0x0040_0000, FaultKind::Read)
            .expect("fault");
        let bytes = frame_bytes(&h.vm, frame);
        assert!(bytes[..16].iter().all(|&b| b == 0x42));
        assert!(bytes[16..].iter().all(|&b| b == 0));
        assert_eq!(h.vm.stats().page_faults_elf, 1);
    }

    #[test]
    fn resident_pages_never_reread_disk() {
        let h = boot(8, config(4));
        let image = Arc::new(CountingFile::new(build(
            0x0040_0000,
            &[Segment {
                vaddr: 0x0040_0000,
                offset: 0x1000,
                data: &[0x77; 64],
                memory_size: 64,
                flags: 5,
            }],
        )));
        let mut space = h.vm.create_address_space(1).expect("address space");
        space.load_elf(image.clone()).expect("load");

        let first = h
            .vm
            .resolve_fault(&space, 0x0040_0000, FaultKind::Read)
            .expect("fault");
        let reads = image.reads().len();
        for _ in 0..3 {
            h.vm.tlb().invalidate_all();
            let again = h
                .vm
                .resolve_fault(&space, 0x0040_0008, FaultKind::Read)
                .expect("fault");
            assert_eq!(again, first);
        }
        assert_eq!(image.reads().len(), reads);

        let stats = h.vm.stats();
        assert_eq!(stats.tlb_reloads, 3);
        assert_eq!(stats.page_faults_disk, 1);
        assert!(stats.is_consistent());
    }

    #[test]
    fn code_pages_are_mapped_read_only() {
        let h = boot(8, config(4));
        let image = build(
            0x0040_0000,
            &[
                Segment {
                    vaddr: 0x0040_0000,
                    offset: 0x1000,
                    data: &[1; 16],
                    memory_size: 16,
                    flags: 5,
                },
                Segment {
                    vaddr: 0x1000_0000,
                    offset: 0x2000,
                    data: &[2; 16],
                    memory_size: 16,
                    flags: 6,
                },
            ],
        );
        let mut space = h.vm.create_address_space(1).expect("address space");
        space
            .load_elf(Arc::new(MemFile::from_bytes(image)))
            .expect("load");

        h.vm.resolve_fault(&space, 0x0040_0000, FaultKind::Write)
            .expect("code fault");
        h.vm.resolve_fault(&space, 0x1000_0000, FaultKind::Write)
            .expect("data fault");

        let (code, code_status) = h.vm.page_table().lookup(1, 0x0040_0000).expect("code");
        let (_, data_status) = h.vm.page_table().lookup(1, 0x1000_0000).expect("data");
        assert!(!code_status.writable());
        assert!(data_status.writable());
        assert_eq!(h.vm.tlb().probe(0x0040_0000, 1), Some(code));

        // The store is retried and now hits the read-only entry.
        assert_eq!(
            h.vm.resolve_fault(&space, 0x0040_0000, FaultKind::ReadOnly),
            Err(VmError::ProtectionViolation)
        );
        assert!(h.vm.page_table().entries_of(1).is_empty());
        assert_eq!(h.vm.tlb().occupancy(), 0);
        assert_eq!(h.frames.free_frames(), 8);
        assert_eq!(space.allocated_frames(), 0);
    }

    #[test]
    fn unmapped_address_is_a_segmentation_fault() {
        let h = boot(8, config(4));
        let space = h.vm.create_address_space(1).expect("address space");
        h.vm.resolve_fault(&space, stack_page(0), FaultKind::Write)
            .expect("stack fault");
        assert_eq!(h.frames.free_frames(), 7);

        let err = h
            .vm
            .resolve_fault(&space, 0x0040_0000, FaultKind::Read)
            .expect_err("no region");
        assert_eq!(err, VmError::SegmentationFault);
        assert_eq!(err.severity(), Severity::Process);
        assert_eq!(h.frames.free_frames(), 8);

        assert_eq!(
            h.vm.resolve_fault(&space, USER_STACK_TOP, FaultKind::Read),
            Err(VmError::SegmentationFault)
        );
    }

    #[test]
    fn ceiling_evicts_only_own_pages() {
        let h = boot(8, config(2));
        let a = h.vm.create_address_space(1).expect("address space");
        let b = h.vm.create_address_space(2).expect("address space");

        let a0 = h.vm.resolve_fault(&a, stack_page(0), FaultKind::Write).expect("fault");
        fill_frame(&h.vm, a0, 0xA0);
        let a1 = h.vm.resolve_fault(&a, stack_page(1), FaultKind::Write).expect("fault");
        fill_frame(&h.vm, a1, 0xA1);
        let b0 = h.vm.resolve_fault(&b, stack_page(0), FaultKind::Write).expect("fault");
        fill_frame(&h.vm, b0, 0xB0);
        assert!(a.at_ceiling());

        // A's oldest page makes room, B is untouched.
        let a2 = h.vm.resolve_fault(&a, stack_page(2), FaultKind::Write).expect("fault");
        assert_eq!(a2, a0);
        assert!(frame_bytes(&h.vm, a2).iter().all(|&b| b == 0));
        assert!(h.vm.swap().contains(1, stack_page(0)));
        assert!(h.vm.page_table().lookup(1, stack_page(0)).is_none());
        assert_eq!(h.vm.page_table().lookup(2, stack_page(0)).map(|(f, _)| f), Some(b0));
        assert!(frame_bytes(&h.vm, b0).iter().all(|&b| b == 0xB0));
        assert_eq!(a.allocated_frames(), 2);

        // Swapping the page back in evicts A's next oldest page.
        let back = h.vm.resolve_fault(&a, stack_page(0), FaultKind::Read).expect("fault");
        assert_eq!(back, a1);
        assert!(frame_bytes(&h.vm, back).iter().all(|&b| b == 0xA0));
        assert!(!h.vm.swap().contains(1, stack_page(0)));
        assert!(h.vm.swap().contains(1, stack_page(1)));

        let stats = h.vm.stats();
        assert_eq!(stats.swap_outs, 2);
        assert_eq!(stats.page_faults_swapin, 1);
        assert_eq!(stats.page_faults_zeroed, 4);
        assert_eq!(stats.tlb_faults, 5);
        assert!(stats.is_consistent());
    }

    #[test]
    fn no_victim_kills_the_process() {
        let h = boot(1, config(2));
        let a = h.vm.create_address_space(1).expect("address space");
        let b = h.vm.create_address_space(2).expect("address space");
        h.vm.resolve_fault(&a, stack_page(0), FaultKind::Write).expect("fault");

        assert_eq!(
            h.vm.resolve_fault(&b, stack_page(0), FaultKind::Write),
            Err(VmError::NoVictim)
        );
        assert_eq!(b.allocated_frames(), 0);
        assert!(h.vm.page_table().lookup(1, stack_page(0)).is_some());
    }

    #[test]
    fn image_read_error_returns_the_frame() {
        let h = boot(4, config(4));
        let file = Arc::new(MemFile::from_bytes(build(
            0x0040_0000,
            &[Segment {
                vaddr: 0x0040_0000,
                offset: 0x1000,
                data: &[9; 32],
                memory_size: 32,
                flags: 5,
            }],
        )));
        let mut space = h.vm.create_address_space(1).expect("address space");
        space.load_elf(file.clone()).expect("load");

        file.set_failing(true);
        let err = h
            .vm
            .resolve_fault(&space, 0x0040_0000, FaultKind::Read)
            .expect_err("read fails");
        assert_eq!(err, VmError::Io(FileError::Device));
        assert_eq!(h.frames.free_frames(), 4);
        assert_eq!(space.allocated_frames(), 0);
        assert!(h.vm.stats().is_consistent());

        file.set_failing(false);
        h.vm.resolve_fault(&space, 0x0040_0000, FaultKind::Read)
            .expect("retry succeeds");
    }

    #[test]
    fn activate_keeps_only_the_current_process() {
        let h = boot(8, config(4));
        let a = h.vm.create_address_space(1).expect("address space");
        let b = h.vm.create_address_space(2).expect("address space");
        for n in 0..3 {
            h.vm.resolve_fault(&a, stack_page(n), FaultKind::Read).expect("fault");
            h.vm.resolve_fault(&b, stack_page(n), FaultKind::Read).expect("fault");
        }
        assert_eq!(h.vm.tlb().occupancy(), 6);

        assert_eq!(h.vm.activate(&a), Invalidation::Selective);
        let tlb = h.vm.tlb();
        assert!((0..tlb.slot_count()).all(|slot| matches!(tlb.slot_owner(slot), None | Some(1))));
        assert_eq!(tlb.occupancy(), 3);
        assert_eq!(h.vm.activate(&a), Invalidation::Noop);
    }

    #[test]
    fn destroy_releases_everything() {
        let h = boot(8, config(2));
        let a = h.vm.create_address_space(1).expect("address space");
        for n in 0..5 {
            h.vm.resolve_fault(&a, stack_page(n), FaultKind::Write).expect("fault");
        }
        assert_eq!(h.vm.swap().valid_slots(), 3);

        h.vm.destroy_address_space(&a);
        assert_eq!(h.vm.swap().valid_slots(), 0);
        assert_eq!(h.vm.tlb().occupancy(), 0);
        assert_eq!(h.frames.free_frames(), 8);
        assert_eq!(a.allocated_frames(), 0);

        let stats = h.vm.teardown();
        assert_eq!(stats.swap_outs, 3);
        assert!(stats.is_consistent());
    }

    #[test]
    fn parallel_faults_keep_pages_apart() {
        let h = boot(32, config(4));
        let vm = &h.vm;
        thread::scope(|s| {
            for pid in 1..=4u16 {
                s.spawn(move || {
                    let space = vm.create_address_space(pid).expect("address space");
                    let marker = |n: usize| [pid.to_le_bytes()[0], u8::try_from(n).expect("page")];
                    for n in 0..20 {
                        let frame = vm
                            .resolve_fault(&space, stack_page(n), FaultKind::Write)
                            .expect("fault");
                        unsafe { vm.memory.frame_mut(frame)[..2].copy_from_slice(&marker(n)) };
                    }
                    for n in 0..20 {
                        let frame = vm
                            .resolve_fault(&space, stack_page(n), FaultKind::Read)
                            .expect("fault");
                        assert_eq!(frame_bytes(vm, frame)[..2], marker(n));
                        // Exactly one copy of every page.
                        let resident = vm.page_table().lookup(pid, stack_page(n)).is_some();
                        assert!(resident);
                        assert!(!vm.swap().contains(pid, stack_page(n)));
                    }
                    assert!(space.allocated_frames() <= 4);
                });
            }
        });

        assert!(h.vm.tlb().occupancy() <= h.vm.tlb().slot_count());
        let stats = h.vm.stats();
        assert_eq!(stats.tlb_faults, 4 * 40);
        assert!(stats.is_consistent());
    }
}
