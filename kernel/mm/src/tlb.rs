//! TLB invalidation, decoupled from the hardware instruction.
//!
//! Any mutation of a present mapping must be followed by an INVLPG of the
//! affected address (or a full CR3 reload). The actual instruction is
//! registered at boot via [`register_flush_hooks`]; before registration
//! flushes are no-ops, which is safe during early boot where no stale TLB
//! entries exist. Host tests register counting hooks to observe flush
//! behavior.

use core::sync::atomic::{AtomicPtr, Ordering};

use meson_core::addr::VirtAddr;

static FLUSH_PAGE_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush_page as *mut ());
static FLUSH_ALL_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush_all as *mut ());

fn nop_flush_page(_vaddr: VirtAddr) {}
fn nop_flush_all() {}

/// Registers the architecture flush functions.
///
/// Called once during early boot with the INVLPG and CR3-reload wrappers.
pub fn register_flush_hooks(flush_page: fn(VirtAddr), flush_all: fn()) {
    FLUSH_PAGE_FN.store(flush_page as *mut (), Ordering::Release);
    FLUSH_ALL_FN.store(flush_all as *mut (), Ordering::Release);
}

/// Invalidates the TLB entry covering `vaddr`.
#[inline]
pub fn flush_page(vaddr: VirtAddr) {
    let ptr = FLUSH_PAGE_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(VirtAddr)` pointers are ever stored.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(vaddr);
}

/// Invalidates all non-global TLB entries.
#[inline]
pub fn flush_all() {
    let ptr = FLUSH_ALL_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn()` pointers are ever stored.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}
