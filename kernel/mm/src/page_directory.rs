//! Address spaces.
//!
//! A [`PageDirectory`] is one PAE translation hierarchy: the PDPT page,
//! its four page directories, the virtual range arena for the space, and
//! owning handles for every page table installed under it. The PDE inside
//! the hardware tables is only a raw view; the handle kept here is the
//! authoritative owner, so dropping a directory returns its page-table
//! frames to the supervisor pool.
//!
//! The kernel directory exists once and its top-gigabyte page directory is
//! shared by reference into every process directory.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use meson_core::addr::PhysAddr;
use meson_core::arch::x86::instructions::interrupts::InterruptDisabler;
use meson_core::arch::x86::structures::paging::PdptEntry;
use meson_core::sync::SpinLock;

use crate::layout;
use crate::manager;
use crate::pmm::PhysicalPage;
use crate::process::Process;
use crate::range::RangeAllocator;
use crate::window;
use crate::BootPagingInfo;

/// PDPT index of the top gigabyte (the kernel's gigabyte).
const KERNEL_PDPT_INDEX: usize = 3;

/// All live page directories, for [`find_by_cr3`].
static DIRECTORIES: SpinLock<Vec<Weak<PageDirectory>>> = SpinLock::new(Vec::new());

/// One address space.
pub struct PageDirectory {
    pdpt_page: Arc<PhysicalPage>,
    directory_pages: [Option<Arc<PhysicalPage>>; 4],
    kernel: bool,
    range_allocator: SpinLock<RangeAllocator>,
    /// Owning handles for page tables installed under this directory,
    /// keyed by `pdpt_index * 512 + pd_index`.
    page_tables: SpinLock<BTreeMap<usize, Arc<PhysicalPage>>>,
    process: SpinLock<Weak<Process>>,
}

impl PageDirectory {
    /// Builds the kernel address space around the boot stub's paging
    /// frames and pre-maps the top gigabyte.
    pub fn new_kernel(boot: &BootPagingInfo) -> Arc<Self> {
        let pdpt_page = PhysicalPage::new_eternal(boot.pdpt, true);
        let directory_pages = [
            Some(PhysicalPage::new_eternal(boot.page_directories[0], true)),
            Some(PhysicalPage::new_eternal(boot.page_directories[1], true)),
            Some(PhysicalPage::new_eternal(boot.page_directories[2], true)),
            Some(PhysicalPage::new_eternal(boot.page_directories[3], true)),
        ];

        // SAFETY: The boot frames live in the kernel window and nothing
        // else references them yet.
        unsafe {
            let pdpt = window::phys_to_virt(boot.pdpt) as *mut PdptEntry;
            for (index, frame) in boot.page_directories.iter().enumerate() {
                let entry = &mut *pdpt.add(index);
                entry.set_page_directory_base(*frame);
                entry.set_present(true);
            }
        }

        let directory = Arc::new(Self {
            pdpt_page,
            directory_pages,
            kernel: true,
            range_allocator: SpinLock::new(RangeAllocator::new(
                meson_core::addr::VirtAddr::new(layout::KERNEL_ARENA_BASE),
                layout::KERNEL_ARENA_SIZE,
            )),
            page_tables: SpinLock::new(BTreeMap::new()),
            process: SpinLock::new(Weak::new()),
        });
        register(&directory);
        directory
    }

    /// Builds a process address space: three private page directories for
    /// the low gigabytes plus the kernel's top-gigabyte directory shared
    /// by reference.
    pub fn new_for_process(kernel_directory: &Arc<PageDirectory>) -> Arc<Self> {
        assert!(kernel_directory.is_kernel());
        let mm = manager::the();
        let _disabler = InterruptDisabler::new();

        let pdpt_page = mm.allocate_supervisor_physical_page();
        let directory_pages = [
            Some(mm.allocate_supervisor_physical_page()),
            Some(mm.allocate_supervisor_physical_page()),
            Some(mm.allocate_supervisor_physical_page()),
            kernel_directory.directory_pages[KERNEL_PDPT_INDEX].clone(),
        ];

        // SAFETY: The PDPT frame is a freshly zeroed supervisor frame in
        // the kernel window.
        unsafe {
            let pdpt = window::phys_to_virt(pdpt_page.paddr()) as *mut PdptEntry;
            for (index, page) in directory_pages.iter().enumerate() {
                let entry = &mut *pdpt.add(index);
                entry.set_page_directory_base(page.as_ref().unwrap().paddr());
                entry.set_present(true);
            }
        }

        let directory = Arc::new(Self {
            pdpt_page,
            directory_pages,
            kernel: false,
            range_allocator: SpinLock::new(RangeAllocator::new(
                meson_core::addr::VirtAddr::new(layout::USER_ARENA_BASE),
                layout::USER_ARENA_SIZE,
            )),
            page_tables: SpinLock::new(BTreeMap::new()),
            process: SpinLock::new(Weak::new()),
        });
        register(&directory);
        directory
    }

    /// Returns the value to load into CR3 for this space.
    pub fn cr3(&self) -> PhysAddr {
        self.pdpt_page.paddr()
    }

    /// Returns `true` for the kernel address space.
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Returns the frame holding page directory `pdpt_index`.
    pub fn directory_page(&self, pdpt_index: usize) -> PhysAddr {
        self.directory_pages[pdpt_index]
            .as_ref()
            .expect("page directory page missing")
            .paddr()
    }

    /// Returns this space's virtual range arena.
    pub fn range_allocator(&self) -> &SpinLock<RangeAllocator> {
        &self.range_allocator
    }

    /// Records ownership of a page table installed at
    /// `pdpt_index * 512 + pd_index`, keeping its frame alive for the
    /// lifetime of this directory.
    pub fn retain_page_table(&self, directory_index: usize, page_table: Arc<PhysicalPage>) {
        self.page_tables.lock().insert(directory_index, page_table);
    }

    /// Looks up a retained page table frame.
    pub fn retained_page_table(&self, directory_index: usize) -> Option<Arc<PhysicalPage>> {
        self.page_tables.lock().get(&directory_index).cloned()
    }

    /// Binds this directory to its owning process.
    pub fn set_process(&self, process: Weak<Process>) {
        *self.process.lock() = process;
    }

    /// Returns the owning process, if it is still alive.
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().upgrade()
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        DIRECTORIES
            .lock()
            .retain(|weak| !core::ptr::eq(weak.as_ptr(), self));
        // Dropping `page_tables` and the directory pages releases their
        // frames back to the supervisor pool.
    }
}

fn register(directory: &Arc<PageDirectory>) {
    let mut directories = DIRECTORIES.lock();
    directories.retain(|weak| weak.strong_count() > 0);
    directories.push(Arc::downgrade(directory));
}

/// Finds the live address space whose PDPT root is `cr3`.
///
/// The page-fault path uses this to recover the faulting process when only
/// the CPU's current translation root is known.
pub fn find_by_cr3(cr3: PhysAddr) -> Option<Arc<PageDirectory>> {
    DIRECTORIES
        .lock()
        .iter()
        .filter_map(Weak::upgrade)
        .find(|directory| directory.cr3() == cr3)
}
