//! Virtual and physical address space layout.
//!
//! The kernel occupies the top gigabyte: the boot stub loads the image at
//! `0xC000_0000` mapped to physical zero, so the first 8 MiB of physical
//! memory are permanently visible through that window. Kernel regions are
//! carved from the arena above the image; the last 4 MiB hold the quickmap
//! window.

use meson_core::addr::VirtAddr;

/// Any virtual address at or above this is kernel-only.
pub const KERNEL_SPLIT: u32 = 0xC000_0000;

/// Size of the boot-mapped kernel physical window (physical `[0, 8 MiB)`
/// visible at `KERNEL_SPLIT + paddr`).
pub const KERNEL_WINDOW_SIZE: usize = 8 * 1024 * 1024;

/// Physical band reserved for the supervisor page pool.
pub const SUPERVISOR_BAND_BASE: u64 = 7 * 1024 * 1024;
/// End (exclusive) of the supervisor physical band.
pub const SUPERVISOR_BAND_END: u64 = 8 * 1024 * 1024;

/// Base of the kernel virtual range arena (above the boot-mapped window).
pub const KERNEL_ARENA_BASE: u32 = 0xC080_0000;
/// Size of the kernel arena; ends below the quickmap window.
pub const KERNEL_ARENA_SIZE: usize = 0x3F00_0000;

/// Base of the per-process user virtual range arena.
pub const USER_ARENA_BASE: u32 = 0x1000_0000;
/// Size of the user arena; ends below the kernel split.
pub const USER_ARENA_SIZE: usize = 0xA000_0000;

/// Base of the 4 MiB quickmap window.
pub const QUICKMAP_WINDOW: u32 = 0xFFE0_0000;

/// Index (within the window's backing page table) and address of the
/// general-purpose quickmap slot.
pub const QUICKMAP_GENERAL_SLOT: usize = 0;
/// Address of the general-purpose quickmap slot.
pub const QUICKMAP_GENERAL_ADDR: VirtAddr = VirtAddr::new(QUICKMAP_WINDOW);

/// Slot index for quickmapping a page directory.
pub const QUICKMAP_PD_SLOT: usize = 4;
/// Address of the page-directory quickmap slot.
pub const QUICKMAP_PD_ADDR: VirtAddr = VirtAddr::new(0xFFE0_4000);

/// Slot index for quickmapping a page table.
pub const QUICKMAP_PT_SLOT: usize = 8;
/// Address of the page-table quickmap slot.
pub const QUICKMAP_PT_ADDR: VirtAddr = VirtAddr::new(0xFFE0_8000);

/// Physical memory below this never enters the page pools.
pub const LOW_MEMORY_LIMIT: u64 = 1024 * 1024;
