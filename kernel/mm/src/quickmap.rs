//! The quickmap paging editor.
//!
//! Most physical frames are not kernel-mapped, so editing translation
//! structures needs a way to reach arbitrary frames. Three fixed slots in
//! the reserved window at the top of the address space are backed by one
//! boot-time page table that is present in every address space; rewriting
//! a slot's entry and flushing its TLB line temporarily exposes any frame:
//!
//! - the PD slot, for the page directory being edited,
//! - the PT slot, for the page table being edited or walked,
//! - one general-purpose slot for frame contents (zero-filling, copies).
//!
//! The PD and PT slots are idempotent: re-mapping the frame already in the
//! slot skips both the write and the flush. The general slot is guarded by
//! a busy flag; re-entering it is a fatal bug, and interrupts must stay
//! disabled across the map/unmap pair.

use core::sync::atomic::{AtomicPtr, Ordering};

use meson_core::addr::{PhysAddr, VirtAddr};
use meson_core::arch::x86::instructions::interrupts;
use meson_core::arch::x86::structures::paging::{PageDirectoryEntry, PageTableEntry};

use crate::layout;
use crate::pmm::PhysicalPage;
use crate::tlb;

/// Resolves the data pointer for a slot once its entry is installed.
pub type SlotResolver = fn(slot: VirtAddr, frame: PhysAddr) -> *mut u8;

fn mmu_resolver(slot: VirtAddr, _frame: PhysAddr) -> *mut u8 {
    // On the target the MMU makes the frame visible at the slot address.
    slot.as_mut_ptr()
}

static SLOT_RESOLVER: AtomicPtr<()> = AtomicPtr::new(mmu_resolver as *mut ());

/// Overrides slot resolution. Host tests point slots at simulated
/// physical memory; the default resolves to the slot's fixed address.
pub fn register_slot_resolver(resolver: SlotResolver) {
    SLOT_RESOLVER.store(resolver as *mut (), Ordering::Release);
}

fn resolve(slot: VirtAddr, frame: PhysAddr) -> *mut u8 {
    let ptr = SLOT_RESOLVER.load(Ordering::Acquire);
    // SAFETY: Only valid `SlotResolver` pointers are ever stored.
    let f: SlotResolver = unsafe { core::mem::transmute(ptr) };
    f(slot, frame)
}

/// State of the quickmap window: the backing page table and the general
/// slot's busy flag.
pub struct Quickmap {
    slots: *mut PageTableEntry,
    general_in_use: bool,
}

// SAFETY: `slots` points at the boot page table, which is mapped at the
// same address in every address space; access is serialized by the
// manager's quickmap lock.
unsafe impl Send for Quickmap {}

impl Quickmap {
    /// Wraps the boot page table that backs the quickmap window.
    pub fn new(slots: *mut PageTableEntry) -> Self {
        Self {
            slots,
            general_in_use: false,
        }
    }

    fn entry(&mut self, slot: usize) -> &mut PageTableEntry {
        // SAFETY: `slots` points at a live 512-entry page table and every
        // slot index is a small constant.
        unsafe { &mut *self.slots.add(slot) }
    }

    /// Rewrites `slot` to expose `frame`, flushing only on change.
    fn map_slot(&mut self, slot: usize, slot_addr: VirtAddr, frame: PhysAddr) -> *mut u8 {
        let entry = self.entry(slot);
        if !entry.is_present() || entry.physical_page_base() != frame {
            entry.set_physical_page_base(frame);
            entry.set_present(true);
            entry.set_writable(true);
            entry.set_user_allowed(false);
            tlb::flush_page(slot_addr);
        }
        resolve(slot_addr, frame)
    }

    /// Exposes page directory `pdpt_index` of `directory` in the PD slot.
    ///
    /// Idempotent: re-mapping the frame already in the slot is a no-op.
    pub fn map_directory(
        &mut self,
        directory: &crate::page_directory::PageDirectory,
        pdpt_index: usize,
    ) -> *mut PageDirectoryEntry {
        let frame = directory.directory_page(pdpt_index);
        self.map_slot(layout::QUICKMAP_PD_SLOT, layout::QUICKMAP_PD_ADDR, frame)
            as *mut PageDirectoryEntry
    }

    /// Exposes the page table at `frame` in the PT slot.
    ///
    /// Idempotent: re-mapping the frame already in the slot is a no-op.
    pub fn map_page_table(&mut self, frame: PhysAddr) -> *mut PageTableEntry {
        self.map_slot(layout::QUICKMAP_PT_SLOT, layout::QUICKMAP_PT_ADDR, frame)
            as *mut PageTableEntry
    }

    /// Exposes an arbitrary frame in the general-purpose slot.
    ///
    /// # Panics
    ///
    /// Re-entering while a mapping is outstanding, or calling with
    /// interrupts enabled, is a fatal bug.
    pub fn map_page(&mut self, page: &PhysicalPage) -> *mut u8 {
        assert!(!interrupts::are_enabled());
        assert!(!self.general_in_use, "nested quickmap of the general slot");
        self.general_in_use = true;

        let frame = page.paddr();
        let entry = self.entry(layout::QUICKMAP_GENERAL_SLOT);
        entry.set_physical_page_base(frame);
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_user_allowed(false);
        tlb::flush_page(layout::QUICKMAP_GENERAL_ADDR);
        resolve(layout::QUICKMAP_GENERAL_ADDR, frame)
    }

    /// Tears down the general-purpose slot mapping.
    pub fn unmap_page(&mut self) {
        assert!(!interrupts::are_enabled());
        assert!(self.general_in_use, "general quickmap slot is not mapped");

        let entry = self.entry(layout::QUICKMAP_GENERAL_SLOT);
        entry.set_physical_page_base(PhysAddr::zero());
        entry.set_present(false);
        entry.set_writable(false);
        tlb::flush_page(layout::QUICKMAP_GENERAL_ADDR);
        self.general_in_use = false;
    }
}
