//! Region backings.
//!
//! A [`VmObject`] owns the physical pages behind one or more regions and
//! knows how to produce them on demand. The memory manager keeps a registry
//! of live VM objects so that, under memory pressure, it can ask the
//! purgeable ones to give their pages back.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use meson_core::addr::PhysAddr;
use meson_core::sync::SpinLock;

use crate::manager;
use crate::pmm::PhysicalPage;
use crate::{PAGE_MASK, PAGE_SIZE};

/// The backing store behind a region.
pub trait VmObject: Send + Sync {
    /// Size in bytes (always a whole number of pages).
    fn size(&self) -> usize;

    /// Number of pages this object can hold.
    fn page_count(&self) -> usize {
        self.size() / PAGE_SIZE
    }

    /// The object's page slots. `None` means the page has not been
    /// committed yet.
    fn physical_pages(&self) -> &SpinLock<Vec<Option<Arc<PhysicalPage>>>>;

    /// Returns `true` if this object's pages may be reclaimed on memory
    /// pressure.
    fn is_purgeable(&self) -> bool {
        false
    }

    /// Releases as many pages as possible, returning how many were freed.
    ///
    /// Called from the allocation path with interrupts disabled and no
    /// manager locks held.
    fn purge_with_interrupts_disabled(&self) -> usize {
        0
    }
}

/// Copies one committed page slot out of a VM object.
pub fn physical_page(vmobject: &dyn VmObject, index: usize) -> Option<Arc<PhysicalPage>> {
    vmobject.physical_pages().lock().get(index)?.clone()
}

/// Anonymous memory: pages appear on commit or first touch, zero-filled.
///
/// [`new_for_physical_range`](Self::new_for_physical_range) instead wraps
/// an existing physical range (MMIO); those pages are eternal and never
/// enter a pool.
pub struct AnonymousVmObject {
    size: usize,
    pages: SpinLock<Vec<Option<Arc<PhysicalPage>>>>,
}

impl AnonymousVmObject {
    /// Creates an anonymous object with no pages committed.
    pub fn new(size: usize) -> Arc<Self> {
        assert!(size % PAGE_SIZE == 0);
        let object = Arc::new(Self {
            size,
            pages: SpinLock::new(alloc::vec![None; size / PAGE_SIZE]),
        });
        register(object.clone());
        object
    }

    /// Wraps the physical range `[paddr, paddr + size)`.
    pub fn new_for_physical_range(paddr: PhysAddr, size: usize) -> Arc<Self> {
        assert!(paddr.is_page_aligned());
        let size = (size + PAGE_MASK) & !PAGE_MASK;
        let pages = (0..size / PAGE_SIZE)
            .map(|i| Some(PhysicalPage::new_eternal(paddr.offset(i * PAGE_SIZE), false)))
            .collect();
        let object = Arc::new(Self {
            size,
            pages: SpinLock::new(pages),
        });
        register(object.clone());
        object
    }
}

impl VmObject for AnonymousVmObject {
    fn size(&self) -> usize {
        self.size
    }

    fn physical_pages(&self) -> &SpinLock<Vec<Option<Arc<PhysicalPage>>>> {
        &self.pages
    }
}

impl Drop for AnonymousVmObject {
    fn drop(&mut self) {
        unregister(self as *const _ as *const ());
    }
}

/// Anonymous memory whose pages may be reclaimed while marked volatile.
pub struct PurgeableVmObject {
    size: usize,
    pages: SpinLock<Vec<Option<Arc<PhysicalPage>>>>,
    volatile: AtomicBool,
    was_purged: AtomicBool,
}

impl PurgeableVmObject {
    /// Creates a purgeable object with no pages committed.
    pub fn new(size: usize) -> Arc<Self> {
        assert!(size % PAGE_SIZE == 0);
        let object = Arc::new(Self {
            size,
            pages: SpinLock::new(alloc::vec![None; size / PAGE_SIZE]),
            volatile: AtomicBool::new(true),
            was_purged: AtomicBool::new(false),
        });
        register(object.clone());
        object
    }

    /// Marks the object volatile (purgeable) or in-use.
    pub fn set_volatile(&self, volatile: bool) {
        self.volatile.store(volatile, Ordering::Release);
    }

    /// Returns `true` if the object lost pages to a purge since the flag
    /// was last cleared.
    pub fn was_purged(&self) -> bool {
        self.was_purged.load(Ordering::Acquire)
    }
}

impl VmObject for PurgeableVmObject {
    fn size(&self) -> usize {
        self.size
    }

    fn physical_pages(&self) -> &SpinLock<Vec<Option<Arc<PhysicalPage>>>> {
        &self.pages
    }

    fn is_purgeable(&self) -> bool {
        true
    }

    fn purge_with_interrupts_disabled(&self) -> usize {
        if !self.volatile.load(Ordering::Acquire) {
            return 0;
        }
        let mut purged = 0;
        let mut pages = self.pages.lock();
        for slot in pages.iter_mut() {
            // Dropping the handle returns the frame to its pool.
            if slot.take().is_some() {
                purged += 1;
            }
        }
        if purged > 0 {
            self.was_purged.store(true, Ordering::Release);
        }
        purged
    }
}

impl Drop for PurgeableVmObject {
    fn drop(&mut self) {
        unregister(self as *const _ as *const ());
    }
}

fn register(object: Arc<dyn VmObject>) {
    if let Some(mm) = manager::active() {
        mm.register_vmobject(&object);
    }
}

fn unregister(object: *const ()) {
    if let Some(mm) = manager::active() {
        mm.unregister_vmobject(object);
    }
}
