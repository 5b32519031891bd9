//! Model Specific Registers.

/// IA32_EFER MSR address.
pub const IA32_EFER: u32 = 0xC000_0080;

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
static EMULATED_EFER: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

bitflags::bitflags! {
    /// IA32_EFER register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EferFlags: u64 {
        /// No-Execute Enable.
        const NO_EXECUTE_ENABLE = 1 << 11;
    }
}

/// The IA32_EFER extended feature register.
pub struct Efer;

impl Efer {
    /// Reads IA32_EFER.
    #[inline]
    pub fn read() -> EferFlags {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let (low, high): (u32, u32);
            // SAFETY: IA32_EFER is a valid, readable MSR on any CPU that
            // reports NX or long mode support.
            unsafe {
                core::arch::asm!(
                    "rdmsr",
                    in("ecx") IA32_EFER,
                    out("eax") low,
                    out("edx") high,
                    options(nomem, nostack, preserves_flags),
                );
            }
            EferFlags::from_bits_retain(u64::from(high) << 32 | u64::from(low))
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        EferFlags::from_bits_retain(EMULATED_EFER.load(core::sync::atomic::Ordering::Acquire))
    }

    /// Writes IA32_EFER.
    ///
    /// # Safety
    ///
    /// The caller must ensure every enabled feature is supported by the CPU.
    #[inline]
    pub unsafe fn write(flags: EferFlags) {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let value = flags.bits();
            let low = value as u32;
            let high = (value >> 32) as u32;
            unsafe {
                core::arch::asm!(
                    "wrmsr",
                    in("ecx") IA32_EFER,
                    in("eax") low,
                    in("edx") high,
                    options(nomem, nostack, preserves_flags),
                );
            }
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        EMULATED_EFER.store(flags.bits(), core::sync::atomic::Ordering::Release);
    }
}
