//! Test fixtures: a simulated machine for exercising the memory manager
//! from host tests.
//!
//! Physical memory is a heap buffer; the kernel window, the quickmap slot
//! resolver and the TLB hooks are pointed at it, the control registers are
//! the emulated ones from `meson-core`, and the memory manager is
//! initialized exactly as on hardware. Tests that touch any of this global
//! state serialize through [`lock`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use alloc::sync::Arc;

use meson_core::addr::{PhysAddr, VirtAddr};
use meson_core::arch::x86::cpuid::{self, CpuFeatures};
use meson_core::arch::x86::structures::paging::PageTableEntry;

use crate::manager::{self, MemoryManager};
use crate::process::{self, Process};
use crate::quickmap;
use crate::range::Range;
use crate::region::{Access, Region};
use crate::tlb;
use crate::vmobject::AnonymousVmObject;
use crate::window;
use crate::{BootPagingInfo, MemoryMapEntry};

/// Serializes tests that touch process-global state (the installed
/// manager, the window offset, the emulated registers, the hooks).
pub(crate) fn lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Flush counting
// ---------------------------------------------------------------------------

static FLUSHED_PAGES: AtomicUsize = AtomicUsize::new(0);
static FULL_FLUSHES: AtomicUsize = AtomicUsize::new(0);

fn counting_flush_page(_vaddr: VirtAddr) {
    FLUSHED_PAGES.fetch_add(1, Ordering::SeqCst);
}

fn counting_flush_all() {
    FULL_FLUSHES.fetch_add(1, Ordering::SeqCst);
}

/// Replaces the TLB hooks with counters.
pub(crate) fn install_counting_flush_hooks() {
    tlb::register_flush_hooks(counting_flush_page, counting_flush_all);
}

pub(crate) fn reset_flush_counts() {
    FLUSHED_PAGES.store(0, Ordering::SeqCst);
    FULL_FLUSHES.store(0, Ordering::SeqCst);
}

pub(crate) fn flush_page_count() -> usize {
    FLUSHED_PAGES.load(Ordering::SeqCst)
}

// ---------------------------------------------------------------------------
// Simulated physical memory
// ---------------------------------------------------------------------------

/// First simulated physical address.
pub(crate) const SIM_BASE: u32 = 0x10_0000;
/// Simulated bank size: `[1 MiB, 9 MiB)`, covering the supervisor band.
pub(crate) const SIM_SIZE: usize = 8 * 1024 * 1024;

const BOOT_PDPT: u32 = 0x20_0000;
const BOOT_PAGE_DIRECTORIES: [u32; 4] = [0x20_1000, 0x20_2000, 0x20_3000, 0x20_4000];
const BOOT_QUICKMAP_PT: u32 = 0x20_5000;

/// A heap-backed physical memory bank.
pub(crate) struct SimBank {
    bytes: Box<[u8]>,
}

impl SimBank {
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; SIM_SIZE].into_boxed_slice(),
        }
    }

    /// Points the kernel window and the quickmap slot resolver at this
    /// bank.
    pub fn install(&self) {
        window::set_window_offset(self.bytes.as_ptr() as usize - SIM_BASE as usize);
        quickmap::register_slot_resolver(|_slot, frame| window::phys_to_virt(frame));
    }
}

/// The boot handoff for the simulated machine.
pub(crate) fn boot_info() -> BootPagingInfo {
    BootPagingInfo {
        pdpt: PhysAddr::new(BOOT_PDPT),
        page_directories: BOOT_PAGE_DIRECTORIES.map(PhysAddr::new),
        quickmap_page_table: window::phys_to_virt(PhysAddr::new(BOOT_QUICKMAP_PT))
            as *mut PageTableEntry,
    }
}

/// The default memory map: user frames in `[3 MiB, 7 MiB)`, supervisor
/// frames in `[7 MiB, 8 MiB)`.
pub(crate) fn default_memory_map() -> [MemoryMapEntry; 1] {
    [MemoryMapEntry::available(0x30_0000, 0x50_0000)]
}

/// A fully initialized memory manager over simulated physical memory.
///
/// Holds the test lock for its lifetime and uninstalls the manager on
/// drop.
pub(crate) struct TestMachine {
    pub mm: Arc<MemoryManager>,
    _bank: SimBank,
    _guard: MutexGuard<'static, ()>,
}

impl TestMachine {
    pub fn new() -> Self {
        Self::with_memory_map(&default_memory_map())
    }

    pub fn with_memory_map(entries: &[MemoryMapEntry]) -> Self {
        let guard = lock();
        let bank = SimBank::new();
        bank.install();
        cpuid::init(
            CpuFeatures::PAE
                | CpuFeatures::PGE
                | CpuFeatures::SMEP
                | CpuFeatures::SMAP
                | CpuFeatures::NX,
        );
        let mm = manager::initialize(entries, &boot_info());
        // `initialize` registers the real flush instructions; tests count
        // flushes instead.
        install_counting_flush_hooks();
        reset_flush_counts();
        Self {
            mm,
            _bank: bank,
            _guard: guard,
        }
    }

    /// Reads one simulated physical byte.
    pub fn read_phys(&self, paddr: PhysAddr) -> u8 {
        // SAFETY: The window points into the live bank.
        unsafe { *window::phys_to_virt(paddr) }
    }

    /// Writes one simulated physical byte.
    pub fn write_phys(&self, paddr: PhysAddr, value: u8) {
        // SAFETY: The window points into the live bank.
        unsafe { *window::phys_to_virt(paddr) = value };
    }
}

impl Drop for TestMachine {
    fn drop(&mut self) {
        process::set_current(None);
        manager::uninstall_for_test();
    }
}

// ---------------------------------------------------------------------------
// Region helpers
// ---------------------------------------------------------------------------

/// Creates a readable, writable, user-accessible anonymous region and
/// adds it to `process`'s region list.
pub(crate) fn user_region(process: &Arc<Process>, base: u32, size: usize) -> Arc<Region> {
    user_region_with(process, base, size, Access::READ | Access::WRITE, true)
}

/// Creates an anonymous region with the given properties and adds it to
/// `process`'s region list.
pub(crate) fn user_region_with(
    process: &Arc<Process>,
    base: u32,
    size: usize,
    access: Access,
    user_accessible: bool,
) -> Arc<Region> {
    let vmobject = AnonymousVmObject::new(size);
    let range = Range::new(VirtAddr::new(base), size);
    let region = if user_accessible {
        Region::new_user_accessible(range, vmobject, 0, "test region", access, true)
    } else {
        Region::new_kernel_only(range, vmobject, 0, "test region", access, true)
    };
    process.add_region(region.clone());
    region
}
