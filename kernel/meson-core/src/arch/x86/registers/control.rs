//! Control register accessors (CR0, CR3, CR4).
//!
//! On non-target builds the registers are emulated by atomics so that the
//! memory manager's boot sequence and address-space switches can be
//! exercised and observed from host tests.

use crate::addr::PhysAddr;

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod emulated {
    use core::sync::atomic::AtomicU32;

    pub static CR0: AtomicU32 = AtomicU32::new(0);
    pub static CR3: AtomicU32 = AtomicU32::new(0);
    pub static CR4: AtomicU32 = AtomicU32::new(0);
}

bitflags::bitflags! {
    /// CR0 flags the kernel manipulates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0Flags: u32 {
        /// Protected mode enable.
        const PROTECTED_MODE = 1 << 0;
        /// Write protect: supervisor writes honor read-only pages.
        const WRITE_PROTECT  = 1 << 16;
        /// Paging enable.
        const PAGING         = 1 << 31;
    }
}

bitflags::bitflags! {
    /// CR4 flags the kernel manipulates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u32 {
        /// Physical Address Extension.
        const PAE  = 1 << 5;
        /// Page Global Enable.
        const PGE  = 1 << 7;
        /// Supervisor Mode Execution Prevention.
        const SMEP = 1 << 20;
        /// Supervisor Mode Access Prevention.
        const SMAP = 1 << 21;
    }
}

/// The CR0 control register.
pub struct Cr0;

impl Cr0 {
    /// Reads CR0.
    #[inline]
    pub fn read() -> Cr0Flags {
        Cr0Flags::from_bits_retain(Self::read_raw())
    }

    /// Reads the raw CR0 value.
    #[inline]
    pub fn read_raw() -> u32 {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let value: u32;
            // SAFETY: Reading CR0 has no side effects.
            unsafe {
                core::arch::asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags));
            }
            value
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        emulated::CR0.load(core::sync::atomic::Ordering::Acquire)
    }

    /// Writes CR0.
    ///
    /// # Safety
    ///
    /// Changing CR0 changes the execution mode of the processor; the caller
    /// must ensure the machine state supports the new value.
    #[inline]
    pub unsafe fn write(flags: Cr0Flags) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) flags.bits(), options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        emulated::CR0.store(flags.bits(), core::sync::atomic::Ordering::Release);
    }
}

/// The CR3 control register: physical base of the current PDPT.
pub struct Cr3;

impl Cr3 {
    /// Reads the current translation root.
    #[inline]
    pub fn read() -> PhysAddr {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let value: u32;
            // SAFETY: Reading CR3 has no side effects.
            unsafe {
                core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
            }
            PhysAddr::new(value)
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        PhysAddr::new(emulated::CR3.load(core::sync::atomic::Ordering::Acquire))
    }

    /// Loads a new translation root, flushing all non-global TLB entries.
    ///
    /// # Safety
    ///
    /// `root` must be the physical base of a valid PDPT.
    #[inline]
    pub unsafe fn write(root: PhysAddr) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u32(), options(nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        emulated::CR3.store(root.as_u32(), core::sync::atomic::Ordering::Release);
    }
}

/// The CR4 control register.
pub struct Cr4;

impl Cr4 {
    /// Reads CR4.
    #[inline]
    pub fn read() -> Cr4Flags {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let value: u32;
            // SAFETY: Reading CR4 has no side effects.
            unsafe {
                core::arch::asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags));
            }
            Cr4Flags::from_bits_retain(value)
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        Cr4Flags::from_bits_retain(emulated::CR4.load(core::sync::atomic::Ordering::Acquire))
    }

    /// Writes CR4.
    ///
    /// # Safety
    ///
    /// The caller must ensure every enabled feature is supported by the CPU.
    #[inline]
    pub unsafe fn write(flags: Cr4Flags) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) flags.bits(), options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        emulated::CR4.store(flags.bits(), core::sync::atomic::Ordering::Release);
    }
}
