//! CPU feature detection and the boot-time feature cache.
//!
//! Features are detected once during early boot and cached; the rest of the
//! kernel consults [`features`]. On non-target builds [`init`] is fed
//! directly by the test harness.

use core::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// CPU capabilities the memory manager cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u32 {
        /// Physical Address Extension (required to boot).
        const PAE  = 1 << 0;
        /// Global pages (CR4.PGE honors the G bit in page tables).
        const PGE  = 1 << 1;
        /// Supervisor Mode Execution Prevention.
        const SMEP = 1 << 2;
        /// Supervisor Mode Access Prevention.
        const SMAP = 1 << 3;
        /// No-execute page protection (EFER.NXE).
        const NX   = 1 << 4;
    }
}

static FEATURES: AtomicU32 = AtomicU32::new(0);

/// Records the detected feature set. Called once during early boot.
pub fn init(features: CpuFeatures) {
    FEATURES.store(features.bits(), Ordering::Release);
}

/// Returns the cached feature set.
pub fn features() -> CpuFeatures {
    CpuFeatures::from_bits_truncate(FEATURES.load(Ordering::Acquire))
}

/// Queries the CPU for the features in [`CpuFeatures`].
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn detect() -> CpuFeatures {
    let mut features = CpuFeatures::empty();

    // Leaf 1: EDX feature bits.
    let (_, _, _, edx) = raw_cpuid(1, 0);
    if edx & (1 << 6) != 0 {
        features |= CpuFeatures::PAE;
    }
    if edx & (1 << 13) != 0 {
        features |= CpuFeatures::PGE;
    }

    // Leaf 7: structured extended features (EBX).
    let (eax, _, _, _) = raw_cpuid(0, 0);
    if eax >= 7 {
        let (_, ebx, _, _) = raw_cpuid(7, 0);
        if ebx & (1 << 7) != 0 {
            features |= CpuFeatures::SMEP;
        }
        if ebx & (1 << 20) != 0 {
            features |= CpuFeatures::SMAP;
        }
    }

    // Extended leaf 0x8000_0001: NX bit in EDX.
    let (eax, _, _, _) = raw_cpuid(0x8000_0000, 0);
    if eax >= 0x8000_0001 {
        let (_, _, _, edx) = raw_cpuid(0x8000_0001, 0);
        if edx & (1 << 20) != 0 {
            features |= CpuFeatures::NX;
        }
    }

    features
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn raw_cpuid(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32) {
    let (eax, ebx, ecx, edx): (u32, u32, u32, u32);
    // SAFETY: CPUID is unprivileged and has no side effects beyond the
    // output registers. EBX is manually preserved because LLVM reserves it.
    unsafe {
        core::arch::asm!(
            "xchg esi, ebx",
            "cpuid",
            "xchg esi, ebx",
            inout("eax") leaf => eax,
            out("esi") ebx,
            inout("ecx") subleaf => ecx,
            out("edx") edx,
            options(nomem, nostack, preserves_flags),
        );
    }
    (eax, ebx, ecx, edx)
}

/// Serializes tests that reconfigure the global feature cache.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_and_query() {
        let _lock = test_lock();
        init(CpuFeatures::PAE | CpuFeatures::NX);
        assert!(features().contains(CpuFeatures::PAE));
        assert!(features().contains(CpuFeatures::NX));
        assert!(!features().contains(CpuFeatures::SMAP));
        init(CpuFeatures::empty());
        assert!(features().is_empty());
    }
}
