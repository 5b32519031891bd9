//! Virtual memory regions.
//!
//! A [`Region`] is a virtual range in some address space with uniform
//! access rights, backed by a slice of a [`VmObject`]. Regions register
//! themselves with the memory manager on creation (kernel or user table,
//! decided by the kernel split) and clean up their mappings, their arena
//! reservation and their registration when dropped. A region never
//! straddles the split.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use meson_core::addr::VirtAddr;
use meson_core::arch::x86::structures::paging::PageFault;
use meson_core::kprintln;
use meson_core::sync::SpinLock;

use crate::manager;
use crate::page_directory::PageDirectory;
use crate::range::Range;
use crate::vmobject::{self, VmObject};
use crate::{is_user_address, PAGE_SIZE, ShouldZeroFill};

bitflags::bitflags! {
    /// Access rights of a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// What the fault handler tells the trap dispatcher to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResponse {
    /// The fault was serviced; resume the faulting instruction.
    Continue,
    /// The access was illegal; terminate the offending process.
    ShouldCrash,
}

/// A virtual address interval with uniform access rights and a backing
/// VM object.
pub struct Region {
    range: Range,
    vmobject: Arc<dyn VmObject>,
    offset_in_vmobject: usize,
    name: String,
    access: Access,
    user_accessible: bool,
    cacheable: bool,
    stack: AtomicBool,
    shared: AtomicBool,
    /// Whether drop returns the range to the address space's arena. Set
    /// for regions whose range was reserved from that arena.
    owns_range: AtomicBool,
    page_directory: SpinLock<Option<Arc<PageDirectory>>>,
}

impl Region {
    /// Creates a kernel-only region over `vmobject` and registers it.
    pub fn new_kernel_only(
        range: Range,
        vmobject: Arc<dyn VmObject>,
        offset_in_vmobject: usize,
        name: &str,
        access: Access,
        cacheable: bool,
    ) -> Arc<Self> {
        Self::construct(range, vmobject, offset_in_vmobject, name, access, false, cacheable)
    }

    /// Creates a user-accessible region over `vmobject` and registers it.
    pub fn new_user_accessible(
        range: Range,
        vmobject: Arc<dyn VmObject>,
        offset_in_vmobject: usize,
        name: &str,
        access: Access,
        cacheable: bool,
    ) -> Arc<Self> {
        Self::construct(range, vmobject, offset_in_vmobject, name, access, true, cacheable)
    }

    fn construct(
        range: Range,
        vmobject: Arc<dyn VmObject>,
        offset_in_vmobject: usize,
        name: &str,
        access: Access,
        user_accessible: bool,
        cacheable: bool,
    ) -> Arc<Self> {
        assert!(range.is_valid());
        assert!(offset_in_vmobject % PAGE_SIZE == 0);
        // A region lives entirely on one side of the kernel split.
        assert_eq!(
            is_user_address(range.base()),
            is_user_address(range.end() - 1),
            "region straddles the kernel split"
        );

        let region = Arc::new(Self {
            range,
            vmobject,
            offset_in_vmobject,
            name: String::from(name),
            access,
            user_accessible,
            cacheable,
            stack: AtomicBool::new(false),
            shared: AtomicBool::new(false),
            owns_range: AtomicBool::new(false),
            page_directory: SpinLock::new(None),
        });
        if let Some(mm) = manager::active() {
            mm.register_region(&region);
        }
        region
    }

    /// Returns the region's base address.
    pub fn vaddr(&self) -> VirtAddr {
        self.range.base()
    }

    /// Returns the region's size in bytes.
    pub fn size(&self) -> usize {
        self.range.size()
    }

    /// Returns the covered range.
    pub fn range(&self) -> Range {
        self.range
    }

    /// Returns the region's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the backing VM object.
    pub fn vmobject(&self) -> &Arc<dyn VmObject> {
        &self.vmobject
    }

    /// Returns the byte offset of this region into its VM object.
    pub fn offset_in_vmobject(&self) -> usize {
        self.offset_in_vmobject
    }

    /// Returns the number of pages this region covers.
    pub fn page_count(&self) -> usize {
        self.range.size() / PAGE_SIZE
    }

    /// Returns `true` if `vaddr` falls inside the region.
    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        self.range.contains(vaddr)
    }

    pub fn is_readable(&self) -> bool {
        self.access.contains(Access::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.access.contains(Access::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.access.contains(Access::EXECUTE)
    }

    pub fn is_user_accessible(&self) -> bool {
        self.user_accessible
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn is_stack(&self) -> bool {
        self.stack.load(Ordering::Acquire)
    }

    pub fn set_stack(&self, stack: bool) {
        self.stack.store(stack, Ordering::Release);
    }

    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    pub fn set_shared(&self, shared: bool) {
        self.shared.store(shared, Ordering::Release);
    }

    /// Marks the range as arena-owned: drop will return it to the bound
    /// address space's range allocator.
    pub fn set_owns_range(&self, owns: bool) {
        self.owns_range.store(owns, Ordering::Release);
    }

    /// Binds this region to the address space that will carry its
    /// mappings.
    pub fn set_page_directory(&self, directory: Arc<PageDirectory>) {
        *self.page_directory.lock() = Some(directory);
    }

    /// Returns the bound address space, if any.
    pub fn page_directory(&self) -> Option<Arc<PageDirectory>> {
        self.page_directory.lock().clone()
    }

    /// Returns the virtual address of page `index` of this region.
    pub fn vaddr_of_page(&self, index: usize) -> VirtAddr {
        self.range.base().offset(index * PAGE_SIZE)
    }

    /// Returns the VM object page slot index backing page `index`.
    pub fn vmobject_page_index(&self, index: usize) -> usize {
        self.offset_in_vmobject / PAGE_SIZE + index
    }

    /// Installs entries for every committed page of the backing object.
    pub fn map(&self, directory: &Arc<PageDirectory>) {
        self.set_page_directory(directory.clone());
        manager::the().map_region(self);
    }

    /// Eagerly commits every page of this region, zero-filled.
    pub fn commit(&self) {
        let mm = manager::the();
        for index in 0..self.page_count() {
            let slot = self.vmobject_page_index(index);
            if self.vmobject.physical_pages().lock()[slot].is_some() {
                continue;
            }
            // Allocate outside the page-table lock: the allocation may have
            // to purge VM objects, which takes their page-table locks.
            let page = mm.allocate_user_physical_page(ShouldZeroFill::Yes);
            self.vmobject.physical_pages().lock()[slot] = Some(page);
            mm.remap_region_page(self, index);
        }
    }

    /// Services a page fault that hit this region.
    pub fn handle_fault(&self, fault: &PageFault) -> PageFaultResponse {
        let index = (fault.vaddr() - self.range.base()) as usize / PAGE_SIZE;
        if !fault.is_protection_violation() {
            let slot = self.vmobject_page_index(index);
            if vmobject::physical_page(&*self.vmobject, slot).is_none() {
                // Zero-fill on first touch.
                let mm = manager::the();
                let page = mm.allocate_user_physical_page(ShouldZeroFill::Yes);
                self.vmobject.physical_pages().lock()[slot] = Some(page);
            }
            manager::the().remap_region_page(self, index);
            return PageFaultResponse::Continue;
        }

        kprintln!(
            "MM: protection violation in region '{}' at {}",
            self.name,
            fault.vaddr()
        );
        PageFaultResponse::ShouldCrash
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let Some(mm) = manager::active() else {
            return;
        };
        mm.unregister_region(self as *const _);
        if let Some(directory) = self.page_directory.lock().take() {
            mm.unmap_region(self, &directory);
            if self.owns_range.load(Ordering::Acquire) {
                directory.range_allocator().lock().deallocate(self.range);
            }
        }
    }
}
