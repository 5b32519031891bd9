//! TLB (Translation Lookaside Buffer) management instructions.

use crate::addr::VirtAddr;
use crate::arch::x86::registers::control::Cr3;

/// Flushes the TLB entry for the given virtual address (INVLPG).
///
/// A no-op on non-target builds; host tests observe flushes through the
/// hooks the memory manager registers instead.
#[inline]
pub fn flush(addr: VirtAddr) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: INVLPG only invalidates a single TLB entry.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) addr.as_u32(),
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = addr;
}

/// Flushes all non-global TLB entries by reloading CR3.
#[inline]
pub fn flush_all() {
    // SAFETY: Writing back the same CR3 value only flushes non-global TLB
    // entries. The page table root is unchanged.
    unsafe { Cr3::write(Cr3::read()) };
}
