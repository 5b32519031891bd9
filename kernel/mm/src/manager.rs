//! The memory manager singleton.
//!
//! Constructed once during early kernel init and installed in a global
//! slot; never torn down. Owns the kernel address space, the physical
//! pools, the quickmap state and the region and VM object registries, and
//! carries every allocation and fault-dispatch entry point.
//!
//! The machine is single-processor: critical sections are protected by
//! disabling interrupts, and every entry point either installs an
//! [`InterruptDisabler`] or asserts that interrupts are already off. Each
//! piece of state sits behind its own spin lock so that page releases and
//! purge callbacks re-entering the manager never meet a lock they already
//! hold.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use meson_core::addr::{PhysAddr, VirtAddr};
use meson_core::arch::x86::cpuid::{self, CpuFeatures};
use meson_core::arch::x86::instructions::interrupts::{self, InterruptDisabler};
use meson_core::arch::x86::registers::control::{Cr0, Cr0Flags, Cr3, Cr4, Cr4Flags};
use meson_core::arch::x86::registers::model_specific::{Efer, EferFlags};
use meson_core::arch::x86::structures::paging::{PageFault, PageTableEntry};
use meson_core::kprintln;
use meson_core::sync::SpinLock;

use crate::layout;
use crate::page_directory::{self, PageDirectory};
use crate::pmm::{PhysicalPage, PhysicalPools};
use crate::process::{self, Process};
use crate::quickmap::Quickmap;
use crate::region::{Access, PageFaultResponse, Region};
use crate::tlb;
use crate::vmobject::{self, AnonymousVmObject, VmObject};
use crate::window;
use crate::{is_user_address, BootPagingInfo, MemoryMapEntry, ShouldZeroFill, PAGE_SIZE};

static ACTIVE: SpinLock<Option<Arc<MemoryManager>>> = SpinLock::new(None);

/// Returns the installed memory manager.
///
/// # Panics
///
/// Panics before [`initialize`] has run.
pub fn the() -> Arc<MemoryManager> {
    ACTIVE
        .lock()
        .clone()
        .expect("memory manager not initialized")
}

/// Returns the installed memory manager, if any.
pub(crate) fn active() -> Option<Arc<MemoryManager>> {
    ACTIVE.lock().clone()
}

/// Constructs the memory manager and installs it as the global instance.
///
/// Runs the boot sequence in strict order: kernel address space, PAE
/// requirement, quickmap window, memory-map parsing, CR4/EFER feature
/// enables, CR3 load, CR0 paging enable, and finally the low-1 MiB guard
/// mapping.
pub fn initialize(memory_map: &[MemoryMapEntry], boot: &BootPagingInfo) -> Arc<MemoryManager> {
    tlb::register_flush_hooks(
        meson_core::arch::x86::instructions::tlb::flush,
        meson_core::arch::x86::instructions::tlb::flush_all,
    );

    let mm = MemoryManager::new(memory_map, boot);
    {
        let mut active = ACTIVE.lock();
        assert!(active.is_none(), "memory manager already initialized");
        *active = Some(mm.clone());
    }
    mm.setup_low_1mb();
    kprintln!("MM initialized");
    mm
}

#[cfg(test)]
pub(crate) fn uninstall_for_test() {
    let taken = ACTIVE.lock().take();
    drop(taken);
}

/// The kernel memory manager.
pub struct MemoryManager {
    kernel_page_directory: Arc<PageDirectory>,
    quickmap: SpinLock<Quickmap>,
    pools: SpinLock<PhysicalPools>,
    kernel_regions: SpinLock<Vec<Weak<Region>>>,
    user_regions: SpinLock<Vec<Weak<Region>>>,
    vmobjects: SpinLock<Vec<Weak<dyn VmObject>>>,
    low_page_table: SpinLock<Option<Arc<PhysicalPage>>>,
}

impl MemoryManager {
    fn new(memory_map: &[MemoryMapEntry], boot: &BootPagingInfo) -> Arc<Self> {
        let kernel_page_directory = PageDirectory::new_kernel(boot);

        if !cpuid::features().contains(CpuFeatures::PAE) {
            kprintln!("x86: cannot boot on machines without PAE support");
            interrupts::halt();
        }

        // The quickmap window sits above the kernel arena; its backing
        // page table came from the boot stub.
        let quickmap = Quickmap::new(boot.quickmap_page_table);
        kprintln!("MM: quickmap window at {}", layout::QUICKMAP_GENERAL_ADDR);

        let pools = PhysicalPools::from_memory_map(memory_map);

        // SAFETY: PAE support was checked above; the remaining CR4 and
        // EFER bits are gated on their own CPU features.
        unsafe {
            Cr4::write(Cr4::read() | Cr4Flags::PAE);

            let features = cpuid::features();
            if features.contains(CpuFeatures::PGE) {
                Cr4::write(Cr4::read() | Cr4Flags::PGE);
                kprintln!("x86: PGE support enabled");
            } else {
                kprintln!("x86: PGE support not detected");
            }
            if features.contains(CpuFeatures::SMEP) {
                Cr4::write(Cr4::read() | Cr4Flags::SMEP);
                kprintln!("x86: SMEP support enabled");
            } else {
                kprintln!("x86: SMEP support not detected");
            }
            if features.contains(CpuFeatures::SMAP) {
                Cr4::write(Cr4::read() | Cr4Flags::SMAP);
                kprintln!("x86: SMAP support enabled");
            } else {
                kprintln!("x86: SMAP support not detected");
            }
            if features.contains(CpuFeatures::NX) {
                Efer::write(Efer::read() | EferFlags::NO_EXECUTE_ENABLE);
                kprintln!("x86: NX support enabled");
            } else {
                kprintln!("x86: NX support not detected");
            }

            Cr3::write(kernel_page_directory.cr3());
            Cr0::write(
                Cr0::read() | Cr0Flags::PAGING | Cr0Flags::WRITE_PROTECT | Cr0Flags::PROTECTED_MODE,
            );
        }

        Arc::new(Self {
            kernel_page_directory,
            quickmap: SpinLock::new(quickmap),
            pools: SpinLock::new(pools),
            kernel_regions: SpinLock::new(Vec::new()),
            user_regions: SpinLock::new(Vec::new()),
            vmobjects: SpinLock::new(Vec::new()),
            low_page_table: SpinLock::new(None),
        })
    }

    /// Builds the low-1 MiB mapping: frame 0 stays unmapped to catch null
    /// dereferences, `[0x1000, 1 MiB)` is writable, `[1 MiB, 2 MiB)` is
    /// kept read-only for the BIOS/ROM shadow.
    fn setup_low_1mb(&self) {
        let _disabler = InterruptDisabler::new();
        let low_page_table = self.allocate_supervisor_physical_page();
        let mut quickmap = self.quickmap.lock();

        let pd = quickmap.map_directory(&self.kernel_page_directory, 0);
        // SAFETY: The PD slot exposes page directory 0 of the kernel
        // address space.
        unsafe {
            for index in 1..4 {
                (*pd.add(index)).set_present(false);
            }
            let pde = &mut *pd;
            pde.set_page_table_base(low_page_table.paddr());
            pde.set_present(true);
            pde.set_huge(false);
            pde.set_writable(true);
            pde.set_user_allowed(false);
            pde.set_execute_disabled(true);
        }

        let pt = quickmap.map_page_table(low_page_table.paddr());
        // SAFETY: The PT slot exposes the freshly allocated table; one PAE
        // page table covers the 2 MiB being described.
        unsafe {
            for offset in (0..2 * 1024 * 1024).step_by(PAGE_SIZE) {
                let pte = &mut *pt.add(offset / PAGE_SIZE);
                pte.set_physical_page_base(PhysAddr::new(offset as u32));
                pte.set_user_allowed(false);
                pte.set_present(offset != 0);
                pte.set_writable(offset < 1024 * 1024);
            }
        }

        *self.low_page_table.lock() = Some(low_page_table);
    }

    /// Returns the kernel address space.
    pub fn kernel_page_directory(&self) -> Arc<PageDirectory> {
        self.kernel_page_directory.clone()
    }

    #[cfg(test)]
    pub(crate) fn low_page_table_paddr(&self) -> PhysAddr {
        self.low_page_table.lock().as_ref().unwrap().paddr()
    }

    // -----------------------------------------------------------------
    // Page table plumbing
    // -----------------------------------------------------------------

    /// Walks to the entry covering `vaddr` in `directory`, allocating the
    /// page table on the way if the directory entry is empty.
    ///
    /// The returned pointer goes through the PT quickmap slot and is valid
    /// until that slot is remapped; the caller holds the quickmap lock.
    fn ensure_pte(
        &self,
        quickmap: &mut Quickmap,
        directory: &Arc<PageDirectory>,
        vaddr: VirtAddr,
    ) -> *mut PageTableEntry {
        assert!(!interrupts::are_enabled());
        let pdpt_index = vaddr.pdpt_index();
        let pd_index = vaddr.pd_index();
        let pt_index = vaddr.pt_index();

        let pd = quickmap.map_directory(directory, pdpt_index);
        // SAFETY: The PD slot exposes a 512-entry page directory.
        let pde = unsafe { &mut *pd.add(pd_index) };
        if !pde.is_present() {
            let page_table = self.allocate_supervisor_physical_page();
            pde.set_page_table_base(page_table.paddr());
            pde.set_user_allowed(true);
            pde.set_present(true);
            pde.set_writable(true);
            pde.set_global(directory.is_kernel());
            // The directory's handle is the authoritative owner of the
            // page-table frame; the entry is only a raw view of it.
            directory.retain_page_table(pdpt_index * 512 + pd_index, page_table);
        }

        let pt = quickmap.map_page_table(pde.page_table_base());
        // SAFETY: The PT slot exposes a 512-entry page table.
        unsafe { pt.add(pt_index) }
    }

    /// Maps `vaddr` to `paddr` in the kernel address space.
    pub fn map_for_kernel(&self, vaddr: VirtAddr, paddr: PhysAddr, cache_disabled: bool) {
        let _disabler = InterruptDisabler::new();
        let mut quickmap = self.quickmap.lock();
        let pte = self.ensure_pte(&mut quickmap, &self.kernel_page_directory, vaddr);
        // SAFETY: `pte` points into the quickmapped page table.
        unsafe {
            let pte = &mut *pte;
            pte.set_physical_page_base(paddr);
            pte.set_present(true);
            pte.set_writable(true);
            pte.set_user_allowed(false);
            pte.set_cache_disabled(cache_disabled);
        }
        tlb::flush_page(vaddr);
    }

    /// Installs not-present guard entries over `[vaddr, vaddr + length)`
    /// in the kernel address space.
    pub fn map_protected(&self, vaddr: VirtAddr, length: usize) {
        let _disabler = InterruptDisabler::new();
        assert!(vaddr.is_page_aligned());
        let mut quickmap = self.quickmap.lock();
        for offset in (0..length).step_by(PAGE_SIZE) {
            let pte_address = vaddr.offset(offset);
            let pte = self.ensure_pte(&mut quickmap, &self.kernel_page_directory, pte_address);
            // SAFETY: `pte` points into the quickmapped page table.
            unsafe {
                let pte = &mut *pte;
                pte.set_physical_page_base(PhysAddr::new(pte_address.as_u32()));
                pte.set_user_allowed(false);
                pte.set_present(false);
                pte.set_writable(false);
            }
            tlb::flush_page(pte_address);
        }
    }

    /// Identity-maps `[vaddr, vaddr + size)` in `directory`.
    pub fn create_identity_mapping(
        &self,
        directory: &Arc<PageDirectory>,
        vaddr: VirtAddr,
        size: usize,
    ) {
        let _disabler = InterruptDisabler::new();
        assert!(vaddr.is_page_aligned());
        let mut quickmap = self.quickmap.lock();
        for offset in (0..size).step_by(PAGE_SIZE) {
            let pte_address = vaddr.offset(offset);
            let pte = self.ensure_pte(&mut quickmap, directory, pte_address);
            // SAFETY: `pte` points into the quickmapped page table.
            unsafe {
                let pte = &mut *pte;
                pte.set_physical_page_base(PhysAddr::new(pte_address.as_u32()));
                pte.set_user_allowed(false);
                pte.set_present(true);
                pte.set_writable(true);
            }
            tlb::flush_page(pte_address);
        }
    }

    /// Read-only walk of `directory`, resolving `vaddr` to a physical
    /// address.
    pub fn translate(&self, directory: &Arc<PageDirectory>, vaddr: VirtAddr) -> Option<PhysAddr> {
        let _disabler = InterruptDisabler::new();
        let mut quickmap = self.quickmap.lock();

        let pd = quickmap.map_directory(directory, vaddr.pdpt_index());
        // SAFETY: The PD slot exposes a 512-entry page directory.
        let pde = unsafe { *pd.add(vaddr.pd_index()) };
        if !pde.is_present() {
            return None;
        }
        if pde.is_huge() {
            let offset = vaddr.as_u32() & 0x1F_FFFF;
            return Some(pde.page_table_base().offset(offset as usize));
        }

        let pt = quickmap.map_page_table(pde.page_table_base());
        // SAFETY: The PT slot exposes a 512-entry page table.
        let pte = unsafe { *pt.add(vaddr.pt_index()) };
        if !pte.is_present() {
            return None;
        }
        Some(pte.physical_page_base().offset(vaddr.page_offset() as usize))
    }

    // -----------------------------------------------------------------
    // Region mapping
    // -----------------------------------------------------------------

    fn map_region_page(
        &self,
        quickmap: &mut Quickmap,
        directory: &Arc<PageDirectory>,
        region: &Region,
        index: usize,
    ) {
        let vaddr = region.vaddr_of_page(index);
        let pte = self.ensure_pte(quickmap, directory, vaddr);
        let page = vmobject::physical_page(&**region.vmobject(), region.vmobject_page_index(index));
        // SAFETY: `pte` points into the quickmapped page table.
        unsafe {
            let pte = &mut *pte;
            match page {
                Some(page) => {
                    pte.set_physical_page_base(page.paddr());
                    pte.set_present(true);
                    pte.set_writable(region.is_writable());
                    pte.set_user_allowed(region.is_user_accessible());
                    pte.set_cache_disabled(!region.is_cacheable());
                    pte.set_execute_disabled(!region.is_executable());
                }
                None => {
                    // Uncommitted: first touch faults into the region.
                    pte.set_physical_page_base(PhysAddr::zero());
                    pte.set_present(false);
                }
            }
        }
        tlb::flush_page(vaddr);
    }

    /// Installs entries for every page of `region` into its bound address
    /// space.
    pub(crate) fn map_region(&self, region: &Region) {
        let _disabler = InterruptDisabler::new();
        let directory = region
            .page_directory()
            .expect("mapping a region with no address space");
        let mut quickmap = self.quickmap.lock();
        for index in 0..region.page_count() {
            self.map_region_page(&mut quickmap, &directory, region, index);
        }
    }

    /// Re-installs the entry for one page of `region` (after a commit or a
    /// serviced fault).
    pub(crate) fn remap_region_page(&self, region: &Region, index: usize) {
        let _disabler = InterruptDisabler::new();
        let directory = region
            .page_directory()
            .expect("remapping a region with no address space");
        let mut quickmap = self.quickmap.lock();
        self.map_region_page(&mut quickmap, &directory, region, index);
    }

    /// Clears every entry of `region` from `directory`.
    pub(crate) fn unmap_region(&self, region: &Region, directory: &Arc<PageDirectory>) {
        let _disabler = InterruptDisabler::new();
        let mut quickmap = self.quickmap.lock();
        for index in 0..region.page_count() {
            let vaddr = region.vaddr_of_page(index);
            let pte = self.ensure_pte(&mut quickmap, directory, vaddr);
            // SAFETY: `pte` points into the quickmapped page table.
            unsafe {
                let pte = &mut *pte;
                pte.set_physical_page_base(PhysAddr::zero());
                pte.set_present(false);
                pte.set_writable(false);
            }
            tlb::flush_page(vaddr);
        }
    }

    // -----------------------------------------------------------------
    // Region allocation
    // -----------------------------------------------------------------

    /// Reserves a kernel virtual range and wraps it in an anonymous-backed
    /// region. With `should_commit` the pages are populated eagerly,
    /// otherwise they appear on first touch.
    pub fn allocate_kernel_region(
        &self,
        size: usize,
        name: &str,
        access: Access,
        user_accessible: bool,
        should_commit: bool,
        cacheable: bool,
    ) -> Arc<Region> {
        let _disabler = InterruptDisabler::new();
        assert!(size % PAGE_SIZE == 0, "unaligned region size");
        let range = self
            .kernel_page_directory
            .range_allocator()
            .lock()
            .allocate_anywhere(size);
        assert!(range.is_valid(), "kernel virtual arena exhausted");

        let vmobject = AnonymousVmObject::new(size);
        let region = if user_accessible {
            Region::new_user_accessible(range, vmobject, 0, name, access, cacheable)
        } else {
            Region::new_kernel_only(range, vmobject, 0, name, access, cacheable)
        };
        region.set_owns_range(true);
        region.set_page_directory(self.kernel_page_directory.clone());
        if should_commit {
            region.commit();
        }
        region
    }

    /// Reserves a kernel virtual range over the physical range
    /// `[paddr, paddr + size)` (MMIO) and maps it.
    pub fn allocate_kernel_region_for_physical_range(
        &self,
        paddr: PhysAddr,
        size: usize,
        name: &str,
        access: Access,
        user_accessible: bool,
        cacheable: bool,
    ) -> Arc<Region> {
        let _disabler = InterruptDisabler::new();
        assert!(size % PAGE_SIZE == 0, "unaligned region size");
        let range = self
            .kernel_page_directory
            .range_allocator()
            .lock()
            .allocate_anywhere(size);
        assert!(range.is_valid(), "kernel virtual arena exhausted");

        let vmobject = AnonymousVmObject::new_for_physical_range(paddr, size);
        let region = if user_accessible {
            Region::new_user_accessible(range, vmobject, 0, name, access, cacheable)
        } else {
            Region::new_kernel_only(range, vmobject, 0, name, access, cacheable)
        };
        region.set_owns_range(true);
        region.map(&self.kernel_page_directory);
        region
    }

    /// [`allocate_kernel_region`](Self::allocate_kernel_region) with user
    /// access, committed.
    pub fn allocate_user_accessible_kernel_region(
        &self,
        size: usize,
        name: &str,
        access: Access,
        cacheable: bool,
    ) -> Arc<Region> {
        self.allocate_kernel_region(size, name, access, true, true, cacheable)
    }

    /// Reserves a kernel virtual range over an existing VM object and maps
    /// its committed pages.
    pub fn allocate_kernel_region_with_vmobject(
        &self,
        vmobject: Arc<dyn VmObject>,
        size: usize,
        name: &str,
        access: Access,
        user_accessible: bool,
        cacheable: bool,
    ) -> Arc<Region> {
        let _disabler = InterruptDisabler::new();
        assert!(size % PAGE_SIZE == 0, "unaligned region size");
        let range = self
            .kernel_page_directory
            .range_allocator()
            .lock()
            .allocate_anywhere(size);
        assert!(range.is_valid(), "kernel virtual arena exhausted");

        let region = if user_accessible {
            Region::new_user_accessible(range, vmobject, 0, name, access, cacheable)
        } else {
            Region::new_kernel_only(range, vmobject, 0, name, access, cacheable)
        };
        region.set_owns_range(true);
        region.map(&self.kernel_page_directory);
        region
    }

    // -----------------------------------------------------------------
    // Physical page allocation
    // -----------------------------------------------------------------

    /// Allocates one frame from the user pool.
    ///
    /// On exhaustion every purgeable VM object is asked to yield its
    /// pages; if any purge frees frames the retry must succeed. A pool
    /// that is empty even after purging is fatal.
    pub fn allocate_user_physical_page(&self, should_zero_fill: ShouldZeroFill) -> Arc<PhysicalPage> {
        let _disabler = InterruptDisabler::new();
        let mut page = self.pools.lock().take_free_user_page();

        if page.is_none() {
            kprintln!("MM: user pool empty, asking purgeable VM objects to yield");
            // Snapshot the registry so the purge callbacks run with no
            // manager locks held.
            let candidates: Vec<Arc<dyn VmObject>> = self
                .vmobjects
                .lock()
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            for object in candidates {
                if !object.is_purgeable() {
                    continue;
                }
                let purged = object.purge_with_interrupts_disabled();
                if purged > 0 {
                    kprintln!("MM: purge reclaimed {} page(s)", purged);
                    page = self.pools.lock().take_free_user_page();
                    assert!(page.is_some(), "purge freed pages but the pool is still empty");
                    break;
                }
            }
        }

        let page = page.expect("MM: no user physical pages available");

        if should_zero_fill == ShouldZeroFill::Yes {
            let mut quickmap = self.quickmap.lock();
            let ptr = quickmap.map_page(&page);
            // SAFETY: The general slot exposes exactly this frame.
            unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE) };
            quickmap.unmap_page();
        }
        page
    }

    /// Allocates one zeroed frame from the supervisor pool.
    ///
    /// No purge fallback: supervisor exhaustion is fatal.
    pub fn allocate_supervisor_physical_page(&self) -> Arc<PhysicalPage> {
        let _disabler = InterruptDisabler::new();
        let page = self
            .pools
            .lock()
            .take_free_supervisor_page()
            .expect("MM: no supervisor physical pages available");
        // Supervisor frames are always visible through the kernel window.
        // SAFETY: The frame lies in the supervisor band, inside the window.
        unsafe { core::ptr::write_bytes(window::phys_to_virt(page.paddr()), 0, PAGE_SIZE) };
        page
    }

    /// Returns a user frame to its pool.
    ///
    /// # Panics
    ///
    /// A frame matching no user region is a programming error.
    pub fn deallocate_user_physical_page(&self, paddr: PhysAddr) {
        let _disabler = InterruptDisabler::new();
        self.pools.lock().deallocate_user(paddr);
    }

    /// Returns a supervisor frame to its pool.
    ///
    /// # Panics
    ///
    /// A frame matching no supervisor region is a programming error.
    pub fn deallocate_supervisor_physical_page(&self, paddr: PhysAddr) {
        let _disabler = InterruptDisabler::new();
        self.pools.lock().deallocate_supervisor(paddr);
    }

    pub(crate) fn deallocate_physical_page(&self, paddr: PhysAddr, supervisor: bool) {
        if supervisor {
            self.deallocate_supervisor_physical_page(paddr);
        } else {
            self.deallocate_user_physical_page(paddr);
        }
    }

    /// User pool capacity in pages.
    pub fn user_pages(&self) -> usize {
        self.pools.lock().user_pages()
    }

    /// User pool pages currently allocated.
    pub fn user_pages_used(&self) -> usize {
        self.pools.lock().user_pages_used()
    }

    /// Supervisor pool capacity in pages.
    pub fn super_pages(&self) -> usize {
        self.pools.lock().super_pages()
    }

    /// Supervisor pool pages currently allocated.
    pub fn super_pages_used(&self) -> usize {
        self.pools.lock().super_pages_used()
    }

    // -----------------------------------------------------------------
    // Fault dispatch
    // -----------------------------------------------------------------

    /// Finds the kernel region covering `vaddr`, if any.
    pub fn kernel_region_from_vaddr(&self, vaddr: VirtAddr) -> Option<Arc<Region>> {
        if is_user_address(vaddr) {
            return None;
        }
        self.kernel_regions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .find(|region| region.contains(vaddr))
    }

    /// Finds the region of `process` covering `vaddr`, if any.
    // TODO: the region list is a linear walk; move to a range-indexed
    // structure once processes carry hundreds of regions.
    pub fn user_region_from_vaddr(process: &Process, vaddr: VirtAddr) -> Option<Arc<Region>> {
        process.region_containing(vaddr)
    }

    /// Finds the covering region for a fault when only the CPU state is
    /// known: kernel table first, then the region list of the process that
    /// owns the current translation root.
    pub fn region_from_vaddr(&self, vaddr: VirtAddr) -> Option<Arc<Region>> {
        if let Some(region) = self.kernel_region_from_vaddr(vaddr) {
            return Some(region);
        }
        let directory = page_directory::find_by_cr3(Cr3::read())?;
        let process = directory.process()?;
        Self::user_region_from_vaddr(&process, vaddr)
    }

    /// Routes a page fault to the covering region.
    ///
    /// Requires interrupts disabled and a current process. A fault with no
    /// covering region tells the caller to terminate the offender.
    pub fn handle_page_fault(&self, fault: &PageFault) -> PageFaultResponse {
        assert!(!interrupts::are_enabled());
        assert!(process::current().is_some(), "page fault with no current process");
        // The quickmap slot is never a legal fault site.
        assert!(
            fault.vaddr().page_base() != layout::QUICKMAP_GENERAL_ADDR,
            "page fault at the quickmap slot"
        );

        let Some(region) = self.region_from_vaddr(fault.vaddr()) else {
            kprintln!("MM: page fault at unmapped {}", fault.vaddr());
            return PageFaultResponse::ShouldCrash;
        };
        region.handle_fault(fault)
    }

    // -----------------------------------------------------------------
    // Registries and paging scope
    // -----------------------------------------------------------------

    /// Registers a region into the kernel or user table, split by its
    /// base address.
    pub fn register_region(&self, region: &Arc<Region>) {
        let _disabler = InterruptDisabler::new();
        let table = if is_user_address(region.vaddr()) {
            &self.user_regions
        } else {
            &self.kernel_regions
        };
        let mut table = table.lock();
        table.retain(|weak| weak.strong_count() > 0);
        table.push(Arc::downgrade(region));
    }

    /// Drops a region from whichever table holds it.
    pub(crate) fn unregister_region(&self, region: *const Region) {
        let _disabler = InterruptDisabler::new();
        self.kernel_regions
            .lock()
            .retain(|weak| !core::ptr::eq(weak.as_ptr(), region));
        self.user_regions
            .lock()
            .retain(|weak| !core::ptr::eq(weak.as_ptr(), region));
    }

    /// Registers a live VM object for the purge walk.
    pub fn register_vmobject(&self, object: &Arc<dyn VmObject>) {
        let _disabler = InterruptDisabler::new();
        let mut objects = self.vmobjects.lock();
        objects.retain(|weak| weak.strong_count() > 0);
        objects.push(Arc::downgrade(object));
    }

    /// Drops a VM object from the registry.
    pub(crate) fn unregister_vmobject(&self, object: *const ()) {
        let _disabler = InterruptDisabler::new();
        self.vmobjects
            .lock()
            .retain(|weak| weak.as_ptr() as *const () != object);
    }

    /// Switches the CPU into `process`'s address space.
    pub fn enter_process_paging_scope(&self, process: &Process) {
        assert!(process::current().is_some());
        let _disabler = InterruptDisabler::new();
        // SAFETY: The process's directory is a live PAE hierarchy.
        unsafe { Cr3::write(process.page_directory().cr3()) };
    }

    #[cfg(test)]
    pub(crate) fn region_table_membership(&self, region: &Arc<Region>) -> (bool, bool) {
        let in_kernel = self
            .kernel_regions
            .lock()
            .iter()
            .any(|weak| core::ptr::eq(weak.as_ptr(), Arc::as_ptr(region)));
        let in_user = self
            .user_regions
            .lock()
            .iter()
            .any(|weak| core::ptr::eq(weak.as_ptr(), Arc::as_ptr(region)));
        (in_kernel, in_user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use crate::testing;
    use crate::vmobject::PurgeableVmObject;
    use meson_core::arch::x86::structures::paging::PageFaultErrorCode;

    #[test]
    fn boot_sequence_configures_control_registers() {
        let machine = testing::TestMachine::new();
        let cr4 = Cr4::read();
        assert!(cr4.contains(Cr4Flags::PAE));
        assert!(cr4.contains(Cr4Flags::PGE));
        assert!(cr4.contains(Cr4Flags::SMEP));
        assert!(cr4.contains(Cr4Flags::SMAP));
        assert!(Efer::read().contains(EferFlags::NO_EXECUTE_ENABLE));
        assert_eq!(Cr3::read(), machine.mm.kernel_page_directory().cr3());
        let cr0 = Cr0::read();
        assert!(cr0.contains(Cr0Flags::PAGING));
        assert!(cr0.contains(Cr0Flags::WRITE_PROTECT));
        assert!(cr0.contains(Cr0Flags::PROTECTED_MODE));
    }

    #[test]
    fn low_1mb_mapping_guards_null_and_rom() {
        let machine = testing::TestMachine::new();
        let table = machine.mm.low_page_table_paddr();
        // SAFETY: The low page table is a supervisor frame in the fixture
        // window.
        unsafe {
            let pt = window::phys_to_virt(table) as *const PageTableEntry;
            // Frame 0 is kept unmapped to catch null dereferences.
            assert!(!(*pt).is_present());
            // Below 1 MiB: present and writable.
            let low = *pt.add(1);
            assert!(low.is_present() && low.is_writable());
            assert_eq!(low.physical_page_base().as_u32(), 0x1000);
            let last_low = *pt.add(255);
            assert!(last_low.is_present() && last_low.is_writable());
            // [1 MiB, 2 MiB): present but read-only.
            let rom = *pt.add(256);
            assert!(rom.is_present() && !rom.is_writable());
            assert_eq!(rom.physical_page_base().as_u32(), 0x10_0000);
            let last = *pt.add(511);
            assert!(last.is_present() && !last.is_writable());
            assert_eq!(last.physical_page_base().as_u32(), 0x1F_F000);
        }
    }

    #[test]
    fn map_for_kernel_translates_and_stays_fresh() {
        let machine = testing::TestMachine::new();
        let mm = &machine.mm;
        let kernel_pd = mm.kernel_page_directory();

        let first = mm.allocate_user_physical_page(ShouldZeroFill::No);
        let second = mm.allocate_user_physical_page(ShouldZeroFill::No);
        machine.write_phys(first.paddr(), 0xAA);
        machine.write_phys(second.paddr(), 0xBB);

        let vaddr = VirtAddr::new(0xC100_0000);
        testing::reset_flush_counts();
        mm.map_for_kernel(vaddr, first.paddr(), false);
        assert!(testing::flush_page_count() >= 1);
        assert_eq!(mm.translate(&kernel_pd, vaddr), Some(first.paddr()));
        assert_eq!(machine.read_phys(mm.translate(&kernel_pd, vaddr).unwrap()), 0xAA);

        // Overwrite the mapping: the new frame shows through.
        mm.map_for_kernel(vaddr, second.paddr(), false);
        assert_eq!(mm.translate(&kernel_pd, vaddr), Some(second.paddr()));
        assert_eq!(machine.read_phys(mm.translate(&kernel_pd, vaddr).unwrap()), 0xBB);

        // Page offsets resolve within the frame.
        assert_eq!(
            mm.translate(&kernel_pd, vaddr.offset(0x123)),
            Some(second.paddr().offset(0x123))
        );
    }

    #[test]
    fn ensure_pte_retains_allocated_page_tables() {
        let machine = testing::TestMachine::new();
        let mm = &machine.mm;
        let kernel_pd = mm.kernel_page_directory();
        let page = mm.allocate_user_physical_page(ShouldZeroFill::No);

        let vaddr = VirtAddr::new(0xC100_0000);
        mm.map_for_kernel(vaddr, page.paddr(), false);
        let key = vaddr.pdpt_index() * 512 + vaddr.pd_index();
        let table = kernel_pd
            .retained_page_table(key)
            .expect("page table frame retained by the directory");
        assert!(table.is_supervisor());
    }

    #[test]
    fn committed_kernel_region_is_mapped_and_accounted() {
        let machine = testing::TestMachine::new();
        let mm = &machine.mm;
        let kernel_pd = mm.kernel_page_directory();

        let used_before = mm.user_pages_used();
        let region = mm.allocate_kernel_region(
            3 * PAGE_SIZE,
            "kmalloc pool",
            Access::READ | Access::WRITE,
            false,
            true,
            true,
        );
        assert_eq!(mm.user_pages_used(), used_before + 3);
        assert!(region.vaddr().as_u32() >= layout::KERNEL_ARENA_BASE);

        for index in 0..3 {
            let paddr = mm
                .translate(&kernel_pd, region.vaddr_of_page(index))
                .expect("committed page is mapped");
            assert_eq!(machine.read_phys(paddr), 0, "committed pages are zeroed");
        }

        let found = mm
            .kernel_region_from_vaddr(region.vaddr())
            .expect("region registered in the kernel table");
        assert!(Arc::ptr_eq(&found, &region));
    }

    #[test]
    fn dropped_region_releases_everything() {
        let machine = testing::TestMachine::new();
        let mm = &machine.mm;
        let kernel_pd = mm.kernel_page_directory();

        let used_before = mm.user_pages_used();
        let free_before = kernel_pd.range_allocator().lock().free_bytes();
        let region = mm.allocate_kernel_region(
            2 * PAGE_SIZE,
            "ephemeral",
            Access::READ | Access::WRITE,
            false,
            true,
            true,
        );
        let vaddr = region.vaddr();
        assert_eq!(mm.user_pages_used(), used_before + 2);

        drop(region);
        assert!(mm.kernel_region_from_vaddr(vaddr).is_none());
        assert_eq!(mm.user_pages_used(), used_before);
        assert_eq!(kernel_pd.range_allocator().lock().free_bytes(), free_before);
        assert_eq!(mm.translate(&kernel_pd, vaddr), None);
    }

    #[test]
    fn region_tables_honor_the_split() {
        let machine = testing::TestMachine::new();
        let process = Process::new("split", 9);
        let kernel_region = machine.mm.allocate_kernel_region(
            PAGE_SIZE,
            "above the split",
            Access::READ | Access::WRITE,
            false,
            false,
            true,
        );
        let user_region = testing::user_region(&process, 0x0804_8000, PAGE_SIZE);

        assert!(kernel_region.vaddr().as_u32() >= layout::KERNEL_SPLIT);
        assert_eq!(
            machine.mm.region_table_membership(&kernel_region),
            (true, false)
        );
        assert_eq!(
            machine.mm.region_table_membership(&user_region),
            (false, true)
        );
    }

    #[test]
    fn user_page_round_trip_restores_the_pool() {
        let machine = testing::TestMachine::new();
        let mm = &machine.mm;

        let used_before = mm.user_pages_used();
        let page = mm.allocate_user_physical_page(ShouldZeroFill::No);
        let paddr = page.paddr();
        assert_eq!(mm.user_pages_used(), used_before + 1);

        // Dropping the last handle routes the frame back to its pool.
        drop(page);
        assert_eq!(mm.user_pages_used(), used_before);
        let again = mm.allocate_user_physical_page(ShouldZeroFill::No);
        assert_eq!(again.paddr(), paddr);
    }

    #[test]
    fn purge_rescues_user_allocation() {
        let machine = testing::TestMachine::with_memory_map(&[
            MemoryMapEntry::available(0x70_0000, 0x10_0000),
            MemoryMapEntry::available(0x80_0000, 0x2000),
        ]);
        let mm = &machine.mm;
        assert_eq!(mm.user_pages(), 2);

        let vmobject = PurgeableVmObject::new(2 * PAGE_SIZE);
        {
            let first = mm.allocate_user_physical_page(ShouldZeroFill::No);
            let second = mm.allocate_user_physical_page(ShouldZeroFill::No);
            machine.write_phys(first.paddr(), 0x5A);
            machine.write_phys(second.paddr(), 0x5A);
            let mut pages = vmobject.physical_pages().lock();
            pages[0] = Some(first);
            pages[1] = Some(second);
        }
        assert_eq!(mm.user_pages_used(), 2);

        // The pool is dry; the purgeable object must save the day, and the
        // returned frame must come back zero-filled.
        let page = mm.allocate_user_physical_page(ShouldZeroFill::Yes);
        assert!(vmobject.was_purged());
        assert_eq!(machine.read_phys(page.paddr()), 0);
        assert_eq!(mm.user_pages_used(), 1);
    }

    #[test]
    #[should_panic(expected = "no supervisor physical pages available")]
    fn supervisor_exhaustion_is_fatal() {
        let machine = testing::TestMachine::new();
        for _ in 0..=machine.mm.super_pages() {
            std::mem::forget(machine.mm.allocate_supervisor_physical_page());
        }
    }

    #[test]
    #[should_panic(expected = "unaligned region size")]
    fn unaligned_region_size_is_fatal() {
        let machine = testing::TestMachine::new();
        let _ = machine.mm.allocate_kernel_region(
            PAGE_SIZE + 1,
            "broken",
            Access::READ,
            false,
            false,
            true,
        );
    }

    #[test]
    #[should_panic(expected = "halted")]
    fn boot_without_pae_halts() {
        let _guard = testing::lock();
        let bank = testing::SimBank::new();
        bank.install();
        cpuid::init(CpuFeatures::empty());
        let _ = initialize(&testing::default_memory_map(), &testing::boot_info());
    }

    fn fault_machine() -> (testing::TestMachine, Arc<Process>) {
        let machine = testing::TestMachine::new();
        let process = Process::new("faulter", 7);
        process::set_current(Some(process.clone()));
        machine.mm.enter_process_paging_scope(&process);
        (machine, process)
    }

    #[test]
    fn fault_outside_any_region_crashes() {
        let (machine, process) = fault_machine();
        // Regions cover [0x08048000, 0x08100000) only.
        testing::user_region(&process, 0x0804_8000, 0xB8 * PAGE_SIZE);

        let _disabler = InterruptDisabler::new();
        let fault = PageFault::new(PageFaultErrorCode::USER, VirtAddr::new(0x5000_0000));
        assert_eq!(
            machine.mm.handle_page_fault(&fault),
            PageFaultResponse::ShouldCrash
        );
    }

    #[test]
    fn not_present_fault_zero_fills_anonymous_page() {
        let (machine, process) = fault_machine();
        let region = testing::user_region(&process, 0x0804_8000, 2 * PAGE_SIZE);
        region.map(process.page_directory());

        let used_before = machine.mm.user_pages_used();
        let _disabler = InterruptDisabler::new();
        let fault = PageFault::new(
            PageFaultErrorCode::USER | PageFaultErrorCode::WRITE,
            VirtAddr::new(0x0804_8010),
        );
        assert_eq!(
            machine.mm.handle_page_fault(&fault),
            PageFaultResponse::Continue
        );
        assert_eq!(machine.mm.user_pages_used(), used_before + 1);

        let paddr = machine
            .mm
            .translate(process.page_directory(), VirtAddr::new(0x0804_8000))
            .expect("faulted page is mapped");
        assert_eq!(machine.read_phys(paddr), 0);
    }

    #[test]
    fn protection_violation_crashes() {
        let (machine, process) = fault_machine();
        let region =
            testing::user_region_with(&process, 0x0804_8000, PAGE_SIZE, Access::READ, true);
        region.map(process.page_directory());

        let _disabler = InterruptDisabler::new();
        let fault = PageFault::new(
            PageFaultErrorCode::PRESENT | PageFaultErrorCode::WRITE | PageFaultErrorCode::USER,
            VirtAddr::new(0x0804_8000),
        );
        assert_eq!(
            machine.mm.handle_page_fault(&fault),
            PageFaultResponse::ShouldCrash
        );
    }

    #[test]
    #[should_panic(expected = "quickmap")]
    fn fault_at_quickmap_slot_is_fatal() {
        let (machine, _process) = fault_machine();
        let _disabler = InterruptDisabler::new();
        let fault = PageFault::new(PageFaultErrorCode::empty(), layout::QUICKMAP_GENERAL_ADDR);
        let _ = machine.mm.handle_page_fault(&fault);
    }

    #[test]
    fn mmio_region_maps_the_given_physical_range() {
        let machine = testing::TestMachine::new();
        let mm = &machine.mm;
        let kernel_pd = mm.kernel_page_directory();

        let region = mm.allocate_kernel_region_for_physical_range(
            PhysAddr::new(0xE000_0000),
            2 * PAGE_SIZE,
            "framebuffer",
            Access::READ | Access::WRITE,
            false,
            false,
        );
        assert!(!region.is_cacheable());
        assert_eq!(
            mm.translate(&kernel_pd, region.vaddr()),
            Some(PhysAddr::new(0xE000_0000))
        );
        assert_eq!(
            mm.translate(&kernel_pd, region.vaddr_of_page(1)),
            Some(PhysAddr::new(0xE000_1000))
        );
    }

    #[test]
    fn map_protected_installs_guard_entries() {
        let machine = testing::TestMachine::new();
        let mm = &machine.mm;
        let kernel_pd = mm.kernel_page_directory();
        let vaddr = VirtAddr::new(0xC200_0000);

        mm.map_protected(vaddr, 2 * PAGE_SIZE);
        // Guard entries are not-present: nothing translates.
        assert_eq!(mm.translate(&kernel_pd, vaddr), None);
        assert_eq!(mm.translate(&kernel_pd, vaddr.offset(PAGE_SIZE)), None);
    }

    #[test]
    fn identity_mapping_translates_to_itself() {
        let machine = testing::TestMachine::new();
        let mm = &machine.mm;
        let kernel_pd = mm.kernel_page_directory();
        let vaddr = VirtAddr::new(0x0030_0000);

        mm.create_identity_mapping(&kernel_pd, vaddr, 2 * PAGE_SIZE);
        assert_eq!(
            mm.translate(&kernel_pd, vaddr),
            Some(PhysAddr::new(0x0030_0000))
        );
        assert_eq!(
            mm.translate(&kernel_pd, vaddr.offset(PAGE_SIZE)),
            Some(PhysAddr::new(0x0030_1000))
        );
    }

    #[test]
    fn uncommitted_region_has_no_mappings_until_commit() {
        let machine = testing::TestMachine::new();
        let mm = &machine.mm;
        let kernel_pd = mm.kernel_page_directory();

        let used_before = mm.user_pages_used();
        let region = mm.allocate_kernel_region(
            2 * PAGE_SIZE,
            "lazy",
            Access::READ | Access::WRITE,
            false,
            false,
            true,
        );
        assert_eq!(mm.user_pages_used(), used_before);
        assert_eq!(mm.translate(&kernel_pd, region.vaddr()), None);

        region.commit();
        assert_eq!(mm.user_pages_used(), used_before + 2);
        assert!(mm.translate(&kernel_pd, region.vaddr()).is_some());
    }
}
