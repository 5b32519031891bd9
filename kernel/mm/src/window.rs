//! Access to low physical memory through the kernel window.
//!
//! The boot stub maps physical `[0, 8 MiB)` at `KERNEL_SPLIT + paddr` in
//! every address space, which covers the kernel image, the boot paging
//! frames and the supervisor band. Frames in that window can be read and
//! written without a quickmap. The offset is adjustable so host tests can
//! point the window at a simulated physical memory bank.

use core::sync::atomic::{AtomicUsize, Ordering};

use meson_core::addr::PhysAddr;

use crate::layout;

static WINDOW_OFFSET: AtomicUsize = AtomicUsize::new(layout::KERNEL_SPLIT as usize);

/// Redirects the window, for host tests running against simulated
/// physical memory.
pub fn set_window_offset(offset: usize) {
    WINDOW_OFFSET.store(offset, Ordering::Release);
}

/// Returns a pointer to the window-mapped bytes of `paddr`.
///
/// Only valid for physical addresses inside the boot-mapped window (the
/// first 8 MiB; see [`layout::KERNEL_WINDOW_SIZE`]).
#[inline]
pub fn phys_to_virt(paddr: PhysAddr) -> *mut u8 {
    let offset = WINDOW_OFFSET.load(Ordering::Acquire);
    offset.wrapping_add(paddr.as_u32() as usize) as *mut u8
}
