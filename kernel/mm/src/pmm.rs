//! Physical page pools.
//!
//! Physical memory is split at parse time into the user pool and the
//! supervisor pool (the `[7 MiB, 8 MiB)` band reserved for page tables and
//! other kernel internals, so user allocations cannot starve them). Each
//! pool is a list of [`PhysicalRegion`]s; a [`PhysicalPage`] is the owning
//! handle for one allocated frame and finds its way back to the right pool
//! when the last reference drops.

use alloc::sync::Arc;
use alloc::vec::Vec;

use meson_core::addr::PhysAddr;
use meson_core::kprintln;

use crate::layout;
use crate::manager;
use crate::{MemoryMapEntry, MemoryMapEntryKind, PAGE_SIZE};

/// Owning handle for one 4 KiB physical frame.
///
/// At most one `PhysicalPage` exists per frame: a frame is either owned
/// (held by a mapping, a VM object or the manager itself) or sitting on
/// exactly one region's free list. The handle remembers which pool the
/// frame came from so release routes correctly.
pub struct PhysicalPage {
    paddr: PhysAddr,
    supervisor: bool,
    may_return: bool,
}

impl PhysicalPage {
    /// Wraps a frame taken from a pool. The frame re-enters its pool when
    /// the last reference drops.
    pub fn new(paddr: PhysAddr, supervisor: bool) -> Arc<Self> {
        Arc::new(Self {
            paddr,
            supervisor,
            may_return: true,
        })
    }

    /// Wraps a frame that never re-enters a pool: boot paging frames and
    /// raw MMIO ranges.
    pub fn new_eternal(paddr: PhysAddr, supervisor: bool) -> Arc<Self> {
        Arc::new(Self {
            paddr,
            supervisor,
            may_return: false,
        })
    }

    /// Returns the frame's physical base address.
    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    /// Returns `true` if the frame came from the supervisor pool.
    pub fn is_supervisor(&self) -> bool {
        self.supervisor
    }
}

impl Drop for PhysicalPage {
    fn drop(&mut self) {
        if !self.may_return {
            return;
        }
        // Before the manager is installed nothing owns pool pages, so a
        // missing manager only happens in unit tests exercising regions
        // directly.
        if let Some(mm) = manager::active() {
            mm.deallocate_physical_page(self.paddr, self.supervisor);
        }
    }
}

/// A contiguous range of physical frames with a free list.
///
/// `lower` and `upper` are both frame bases; `upper` is inclusive. Regions
/// start degenerate (one frame) during memory-map parsing, grow page by
/// page through [`expand`](Self::expand), and are sealed by
/// [`finalize_capacity`](Self::finalize_capacity) before any allocation.
pub struct PhysicalRegion {
    lower: PhysAddr,
    upper: PhysAddr,
    pages: usize,
    used: usize,
    free_list: Vec<usize>,
    finalized: bool,
}

impl PhysicalRegion {
    /// Creates a region covering `[lower, upper]`.
    pub fn new(lower: PhysAddr, upper: PhysAddr) -> Self {
        assert!(lower.is_page_aligned() && upper.is_page_aligned());
        assert!(lower <= upper);
        Self {
            lower,
            upper,
            pages: 0,
            used: 0,
            free_list: Vec::new(),
            finalized: false,
        }
    }

    /// Grows the region to cover `[lower, upper]`.
    pub fn expand(&mut self, lower: PhysAddr, upper: PhysAddr) {
        assert!(!self.finalized);
        assert!(lower <= upper);
        self.lower = lower;
        self.upper = upper;
    }

    /// Seals the region and returns its page count. All frames start free.
    pub fn finalize_capacity(&mut self) -> usize {
        assert!(!self.finalized);
        self.finalized = true;
        self.pages = ((self.upper - self.lower) as usize / PAGE_SIZE) + 1;
        // Built in reverse so pops hand out ascending frame addresses.
        self.free_list = (0..self.pages).rev().collect();
        self.pages
    }

    /// Returns the first frame base.
    pub fn lower(&self) -> PhysAddr {
        self.lower
    }

    /// Returns the last frame base (inclusive).
    pub fn upper(&self) -> PhysAddr {
        self.upper
    }

    /// Returns the sealed page count.
    pub fn capacity(&self) -> usize {
        self.pages
    }

    /// Returns the number of frames currently taken.
    pub fn used_count(&self) -> usize {
        self.used
    }

    /// Returns the number of frames currently free.
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Returns `true` if `paddr` falls within this region's frame range.
    pub fn contains(&self, paddr: PhysAddr) -> bool {
        paddr >= self.lower && paddr <= self.upper
    }

    /// Takes one free frame, lowest address first.
    pub fn take_free_page(&mut self, supervisor: bool) -> Option<Arc<PhysicalPage>> {
        assert!(self.finalized);
        let index = self.free_list.pop()?;
        self.used += 1;
        Some(PhysicalPage::new(
            self.lower.offset(index * PAGE_SIZE),
            supervisor,
        ))
    }

    /// Reinserts a frame into the free list.
    pub fn return_page(&mut self, paddr: PhysAddr) {
        assert!(self.finalized);
        assert!(self.contains(paddr), "returned frame outside region");
        let index = (paddr - self.lower) as usize / PAGE_SIZE;
        debug_assert!(!self.free_list.contains(&index), "frame returned twice");
        self.free_list.push(index);
        self.used -= 1;
    }
}

/// The supervisor and user pools plus their usage counters.
pub struct PhysicalPools {
    user_regions: Vec<PhysicalRegion>,
    super_regions: Vec<PhysicalRegion>,
    user_pages: usize,
    super_pages: usize,
    user_pages_used: usize,
    super_pages_used: usize,
}

impl PhysicalPools {
    /// Builds the pools from the bootloader memory map.
    ///
    /// Rejects entries that are not available RAM, lie below 1 MiB, or
    /// extend past the 32-bit physical limit. Unaligned bases are rounded
    /// up and lengths rounded down to whole frames. Frames inside the
    /// `[7 MiB, 8 MiB)` band feed the supervisor pool, everything else the
    /// user pool; contiguous same-pool frames extend the current region.
    pub fn from_memory_map(entries: &[MemoryMapEntry]) -> Self {
        let mut pools = Self {
            user_regions: Vec::new(),
            super_regions: Vec::new(),
            user_pages: 0,
            super_pages: 0,
            user_pages_used: 0,
            super_pages_used: 0,
        };

        // Pool of the most recently accepted frame; a pool switch always
        // starts a new region.
        let mut last_was_super: Option<bool> = None;

        for entry in entries {
            kprintln!(
                "MM: memory map entry: base={:#x} length={:#x} kind={:?}",
                entry.base,
                entry.length,
                entry.kind
            );

            if entry.kind != MemoryMapEntryKind::Available {
                continue;
            }
            if entry.base < layout::LOW_MEMORY_LIMIT {
                continue;
            }
            if entry.base + entry.length > u64::from(u32::MAX) + 1 {
                continue;
            }

            let mut base = entry.base;
            let mut length = entry.length;
            let misalignment = base % PAGE_SIZE as u64;
            if misalignment != 0 {
                let correction = PAGE_SIZE as u64 - misalignment;
                kprintln!(
                    "MM: unaligned region base from bootloader; correcting {:#x} by {} bytes",
                    base,
                    correction
                );
                base += correction;
                length -= correction;
            }
            if length % PAGE_SIZE as u64 != 0 {
                kprintln!(
                    "MM: unaligned region length from bootloader; dropping {} trailing bytes",
                    length % PAGE_SIZE as u64
                );
                length -= length % PAGE_SIZE as u64;
            }
            if length < PAGE_SIZE as u64 {
                continue;
            }

            let mut page_base = base;
            while page_base < base + length {
                let addr = PhysAddr::new(page_base as u32);
                let supervisor = (layout::SUPERVISOR_BAND_BASE..layout::SUPERVISOR_BAND_END)
                    .contains(&page_base);
                let regions = if supervisor {
                    &mut pools.super_regions
                } else {
                    &mut pools.user_regions
                };

                let contiguous = last_was_super == Some(supervisor)
                    && regions
                        .last()
                        .is_some_and(|region| region.upper().offset(PAGE_SIZE) == addr);
                if contiguous {
                    let region = regions.last_mut().unwrap();
                    let lower = region.lower();
                    region.expand(lower, addr);
                } else {
                    regions.push(PhysicalRegion::new(addr, addr));
                }
                last_was_super = Some(supervisor);
                page_base += PAGE_SIZE as u64;
            }
        }

        for region in &mut pools.super_regions {
            pools.super_pages += region.finalize_capacity();
        }
        for region in &mut pools.user_regions {
            pools.user_pages += region.finalize_capacity();
        }

        kprintln!(
            "MM: {} supervisor pages in {} region(s), {} user pages in {} region(s)",
            pools.super_pages,
            pools.super_regions.len(),
            pools.user_pages,
            pools.user_regions.len()
        );

        pools
    }

    /// Takes a free frame from the user pool, if any.
    pub fn take_free_user_page(&mut self) -> Option<Arc<PhysicalPage>> {
        for region in &mut self.user_regions {
            if let Some(page) = region.take_free_page(false) {
                self.user_pages_used += 1;
                return Some(page);
            }
        }
        None
    }

    /// Takes a free frame from the supervisor pool, if any.
    pub fn take_free_supervisor_page(&mut self) -> Option<Arc<PhysicalPage>> {
        for region in &mut self.super_regions {
            if let Some(page) = region.take_free_page(true) {
                self.super_pages_used += 1;
                return Some(page);
            }
        }
        None
    }

    /// Returns a user frame to the region that owns it.
    ///
    /// # Panics
    ///
    /// A frame matching no user region is a programming error.
    pub fn deallocate_user(&mut self, paddr: PhysAddr) {
        for region in &mut self.user_regions {
            if region.contains(paddr) {
                region.return_page(paddr);
                self.user_pages_used -= 1;
                return;
            }
        }
        panic!("MM: no user region owns frame {paddr}");
    }

    /// Returns a supervisor frame to the region that owns it.
    ///
    /// # Panics
    ///
    /// A frame matching no supervisor region is a programming error.
    pub fn deallocate_supervisor(&mut self, paddr: PhysAddr) {
        for region in &mut self.super_regions {
            if region.contains(paddr) {
                region.return_page(paddr);
                self.super_pages_used -= 1;
                return;
            }
        }
        panic!("MM: no supervisor region owns frame {paddr}");
    }

    /// Returns the user pool's regions.
    pub fn user_regions(&self) -> &[PhysicalRegion] {
        &self.user_regions
    }

    /// Returns the supervisor pool's regions.
    pub fn super_regions(&self) -> &[PhysicalRegion] {
        &self.super_regions
    }

    /// Total user pool capacity in pages.
    pub fn user_pages(&self) -> usize {
        self.user_pages
    }

    /// User pool pages currently allocated.
    pub fn user_pages_used(&self) -> usize {
        self.user_pages_used
    }

    /// Total supervisor pool capacity in pages.
    pub fn super_pages(&self) -> usize {
        self.super_pages
    }

    /// Supervisor pool pages currently allocated.
    pub fn super_pages_used(&self) -> usize {
        self.super_pages_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(lower: u32, upper: u32) -> PhysicalRegion {
        let mut region = PhysicalRegion::new(PhysAddr::new(lower), PhysAddr::new(upper));
        region.finalize_capacity();
        region
    }

    #[test]
    fn degenerate_region_has_one_page() {
        let mut r = PhysicalRegion::new(PhysAddr::new(0x30_0000), PhysAddr::new(0x30_0000));
        assert_eq!(r.finalize_capacity(), 1);
    }

    #[test]
    fn expand_then_finalize() {
        let mut r = PhysicalRegion::new(PhysAddr::new(0x30_0000), PhysAddr::new(0x30_0000));
        r.expand(PhysAddr::new(0x30_0000), PhysAddr::new(0x30_5000));
        assert_eq!(r.finalize_capacity(), 6);
    }

    #[test]
    fn take_hands_out_ascending_frames() {
        let _lock = crate::testing::lock();
        let mut r = region(0x30_0000, 0x30_2000);
        assert_eq!(r.take_free_page(false).unwrap().paddr().as_u32(), 0x30_0000);
        assert_eq!(r.take_free_page(false).unwrap().paddr().as_u32(), 0x30_1000);
        assert_eq!(r.take_free_page(false).unwrap().paddr().as_u32(), 0x30_2000);
        assert!(r.take_free_page(false).is_none());
    }

    #[test]
    fn take_marks_supervisor_origin() {
        let _lock = crate::testing::lock();
        let mut r = region(0x70_0000, 0x70_0000);
        let page = r.take_free_page(true).unwrap();
        assert!(page.is_supervisor());
    }

    #[test]
    fn return_makes_frame_available_again() {
        let _lock = crate::testing::lock();
        let mut r = region(0x30_0000, 0x30_1000);
        let first = r.take_free_page(false).unwrap();
        let paddr = first.paddr();
        let _second = r.take_free_page(false).unwrap();
        assert_eq!(r.free_count(), 0);
        r.return_page(paddr);
        assert_eq!(r.free_count(), 1);
        assert_eq!(r.take_free_page(false).unwrap().paddr(), paddr);
    }

    #[test]
    fn frame_conservation() {
        let _lock = crate::testing::lock();
        let mut r = region(0x30_0000, 0x30_7000);
        let capacity = r.capacity();
        let a = r.take_free_page(false).unwrap();
        let _b = r.take_free_page(false).unwrap();
        assert_eq!(r.used_count() + r.free_count(), capacity);
        r.return_page(a.paddr());
        assert_eq!(r.used_count() + r.free_count(), capacity);
        assert_eq!(r.used_count(), 1);
    }

    #[test]
    fn contains_bounds() {
        let r = region(0x30_0000, 0x30_2000);
        assert!(r.contains(PhysAddr::new(0x30_0000)));
        assert!(r.contains(PhysAddr::new(0x30_2000)));
        assert!(!r.contains(PhysAddr::new(0x2F_F000)));
        assert!(!r.contains(PhysAddr::new(0x30_3000)));
    }

    #[test]
    fn memory_map_partitions_supervisor_band() {
        // One entry straddling the supervisor band, one past it, one
        // reserved entry that must be ignored.
        let entries = [
            MemoryMapEntry::available(0x10_0000, 0x70_0000),
            MemoryMapEntry::available(0x80_0000, 0x10_0000),
            MemoryMapEntry::reserved(0xA_0000, 0x2_0000),
        ];
        let pools = PhysicalPools::from_memory_map(&entries);

        assert_eq!(pools.super_pages(), 256);
        assert_eq!(pools.super_regions().len(), 1);
        assert_eq!(pools.super_regions()[0].lower().as_u32(), 0x70_0000);
        assert_eq!(pools.super_regions()[0].upper().as_u32(), 0x7F_F000);

        assert_eq!(pools.user_pages(), 1792);
        assert_eq!(pools.user_regions().len(), 2);
        assert_eq!(pools.user_regions()[0].lower().as_u32(), 0x10_0000);
        assert_eq!(pools.user_regions()[0].upper().as_u32(), 0x6F_F000);
        assert_eq!(pools.user_regions()[1].lower().as_u32(), 0x80_0000);
        assert_eq!(pools.user_regions()[1].upper().as_u32(), 0x8F_F000);
    }

    #[test]
    fn memory_map_corrects_unaligned_entry() {
        let entries = [MemoryMapEntry::available(0x10_0001, 0x1F_FFFE)];
        let pools = PhysicalPools::from_memory_map(&entries);
        // Base rounds up to 0x101000; the remaining 0x1EFFFF bytes round
        // down to 495 whole frames.
        assert_eq!(pools.user_pages(), 495);
        assert_eq!(pools.user_regions()[0].lower().as_u32(), 0x10_1000);
        assert_eq!(pools.user_regions()[0].upper().as_u32(), 0x2E_F000);
    }

    #[test]
    fn memory_map_discards_low_memory() {
        let entries = [MemoryMapEntry::available(0x5_0000, 0x5_0000)];
        let pools = PhysicalPools::from_memory_map(&entries);
        assert_eq!(pools.user_pages(), 0);
        assert_eq!(pools.super_pages(), 0);
    }

    #[test]
    fn memory_map_discards_entries_past_4gib() {
        let entries = [MemoryMapEntry::available(0xFFFF_F000, 0x2000)];
        let pools = PhysicalPools::from_memory_map(&entries);
        assert_eq!(pools.user_pages(), 0);
    }

    #[test]
    fn memory_map_discards_subpage_remainder() {
        let entries = [MemoryMapEntry::available(0x20_0001, 0x1500)];
        let pools = PhysicalPools::from_memory_map(&entries);
        assert_eq!(pools.user_pages(), 0);
    }

    #[test]
    fn pool_counters_track_allocation() {
        let _lock = crate::testing::lock();
        let entries = [MemoryMapEntry::available(0x70_0000, 0x20_0000)];
        let mut pools = PhysicalPools::from_memory_map(&entries);
        assert_eq!(pools.super_pages(), 256);
        assert_eq!(pools.user_pages(), 256);

        let user = pools.take_free_user_page().unwrap();
        let sup = pools.take_free_supervisor_page().unwrap();
        assert_eq!(pools.user_pages_used(), 1);
        assert_eq!(pools.super_pages_used(), 1);
        assert!(user.paddr().as_u32() >= 0x80_0000);
        assert!(sup.paddr().as_u32() < 0x80_0000);

        let (user_paddr, sup_paddr) = (user.paddr(), sup.paddr());
        drop(user);
        drop(sup);
        // No manager installed here, so the handles do not auto-return;
        // exercise the explicit path.
        pools.deallocate_user(user_paddr);
        pools.deallocate_supervisor(sup_paddr);
        assert_eq!(pools.user_pages_used(), 0);
        assert_eq!(pools.super_pages_used(), 0);
    }

    #[test]
    #[should_panic(expected = "no user region owns frame")]
    fn deallocating_foreign_frame_is_fatal() {
        let _lock = crate::testing::lock();
        let entries = [MemoryMapEntry::available(0x30_0000, 0x10_0000)];
        let mut pools = PhysicalPools::from_memory_map(&entries);
        pools.deallocate_user(PhysAddr::new(0x50_0000));
    }
}
