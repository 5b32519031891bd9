//! PAE page translation structures.
//!
//! PAE arranges translation as a 4-entry PDPT, 512-entry page directories
//! and 512-entry page tables, all with 64-bit entries mapping 4 KiB pages.
//! The accessors here are field views over raw entries: every setter
//! preserves the bits it does not own, because entries are edited in place
//! while live. An entry with the present bit clear is unmapped to the
//! hardware no matter what the remaining bits say; software keeps them as
//! opaque metadata.

use crate::addr::{PhysAddr, VirtAddr};
use crate::arch::x86::cpuid::{self, CpuFeatures};

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of entries in the PDPT.
pub const PDPT_ENTRIES: usize = 4;

/// Physical base field of a PAE entry (bits 12..32 on this machine).
pub const ENTRY_ADDRESS_MASK: u64 = 0xFFFF_F000;

const PRESENT: u64 = 1 << 0;
const WRITABLE: u64 = 1 << 1;
const USER_ALLOWED: u64 = 1 << 2;
const WRITE_THROUGH: u64 = 1 << 3;
const CACHE_DISABLED: u64 = 1 << 4;
const ACCESSED: u64 = 1 << 5;
const DIRTY: u64 = 1 << 6;
const HUGE: u64 = 1 << 7;
const GLOBAL: u64 = 1 << 8;
const EXECUTE_DISABLED: u64 = 1 << 63;

#[inline]
fn set_bit(raw: &mut u64, bit: u64, value: bool) {
    if value {
        *raw |= bit;
    } else {
        *raw &= !bit;
    }
}

/// A 64-bit PAE page table entry mapping one 4 KiB page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the physical base of the mapped page.
    pub const fn physical_page_base(self) -> PhysAddr {
        PhysAddr::new((self.0 & ENTRY_ADDRESS_MASK) as u32)
    }

    /// Points the entry at a new page frame, preserving all flag bits.
    pub fn set_physical_page_base(&mut self, base: PhysAddr) {
        debug_assert!(base.is_page_aligned());
        self.0 = (self.0 & !ENTRY_ADDRESS_MASK) | u64::from(base.as_u32());
    }

    pub const fn is_present(self) -> bool {
        self.0 & PRESENT != 0
    }

    pub fn set_present(&mut self, value: bool) {
        set_bit(&mut self.0, PRESENT, value);
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn set_writable(&mut self, value: bool) {
        set_bit(&mut self.0, WRITABLE, value);
    }

    pub const fn is_user_allowed(self) -> bool {
        self.0 & USER_ALLOWED != 0
    }

    pub fn set_user_allowed(&mut self, value: bool) {
        set_bit(&mut self.0, USER_ALLOWED, value);
    }

    pub const fn is_write_through(self) -> bool {
        self.0 & WRITE_THROUGH != 0
    }

    pub fn set_write_through(&mut self, value: bool) {
        set_bit(&mut self.0, WRITE_THROUGH, value);
    }

    pub const fn is_cache_disabled(self) -> bool {
        self.0 & CACHE_DISABLED != 0
    }

    pub fn set_cache_disabled(&mut self, value: bool) {
        set_bit(&mut self.0, CACHE_DISABLED, value);
    }

    pub const fn is_accessed(self) -> bool {
        self.0 & ACCESSED != 0
    }

    pub const fn is_dirty(self) -> bool {
        self.0 & DIRTY != 0
    }

    pub const fn is_global(self) -> bool {
        self.0 & GLOBAL != 0
    }

    pub fn set_global(&mut self, value: bool) {
        set_bit(&mut self.0, GLOBAL, value);
    }

    pub const fn is_execute_disabled(self) -> bool {
        self.0 & EXECUTE_DISABLED != 0
    }

    /// Sets the no-execute bit. Silently ignored when the CPU does not
    /// support NX (the bit would be reserved and fault on load).
    pub fn set_execute_disabled(&mut self, value: bool) {
        if !cpuid::features().contains(CpuFeatures::NX) {
            return;
        }
        set_bit(&mut self.0, EXECUTE_DISABLED, value);
    }
}

/// A 64-bit PAE page directory entry referencing one page table
/// (or mapping a 2 MiB page when the huge bit is set).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageDirectoryEntry(u64);

impl PageDirectoryEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the physical base of the referenced page table.
    pub const fn page_table_base(self) -> PhysAddr {
        PhysAddr::new((self.0 & ENTRY_ADDRESS_MASK) as u32)
    }

    /// Points the entry at a new page table, preserving all flag bits.
    pub fn set_page_table_base(&mut self, base: PhysAddr) {
        debug_assert!(base.is_page_aligned());
        self.0 = (self.0 & !ENTRY_ADDRESS_MASK) | u64::from(base.as_u32());
    }

    pub const fn is_present(self) -> bool {
        self.0 & PRESENT != 0
    }

    pub fn set_present(&mut self, value: bool) {
        set_bit(&mut self.0, PRESENT, value);
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub fn set_writable(&mut self, value: bool) {
        set_bit(&mut self.0, WRITABLE, value);
    }

    pub const fn is_user_allowed(self) -> bool {
        self.0 & USER_ALLOWED != 0
    }

    pub fn set_user_allowed(&mut self, value: bool) {
        set_bit(&mut self.0, USER_ALLOWED, value);
    }

    pub const fn is_cache_disabled(self) -> bool {
        self.0 & CACHE_DISABLED != 0
    }

    pub fn set_cache_disabled(&mut self, value: bool) {
        set_bit(&mut self.0, CACHE_DISABLED, value);
    }

    /// Returns `true` if this entry maps a 2 MiB page directly.
    pub const fn is_huge(self) -> bool {
        self.0 & HUGE != 0
    }

    pub fn set_huge(&mut self, value: bool) {
        set_bit(&mut self.0, HUGE, value);
    }

    pub const fn is_global(self) -> bool {
        self.0 & GLOBAL != 0
    }

    pub fn set_global(&mut self, value: bool) {
        set_bit(&mut self.0, GLOBAL, value);
    }

    pub const fn is_execute_disabled(self) -> bool {
        self.0 & EXECUTE_DISABLED != 0
    }

    /// Sets the no-execute bit. Silently ignored when the CPU does not
    /// support NX.
    pub fn set_execute_disabled(&mut self, value: bool) {
        if !cpuid::features().contains(CpuFeatures::NX) {
            return;
        }
        set_bit(&mut self.0, EXECUTE_DISABLED, value);
    }
}

/// A 64-bit PDPT entry referencing one page directory.
///
/// PDPT entries carry only the present bit and cache controls; access
/// rights live in the lower levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PdptEntry(u64);

impl PdptEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the physical base of the referenced page directory.
    pub const fn page_directory_base(self) -> PhysAddr {
        PhysAddr::new((self.0 & ENTRY_ADDRESS_MASK) as u32)
    }

    /// Points the entry at a new page directory, preserving flag bits.
    pub fn set_page_directory_base(&mut self, base: PhysAddr) {
        debug_assert!(base.is_page_aligned());
        self.0 = (self.0 & !ENTRY_ADDRESS_MASK) | u64::from(base.as_u32());
    }

    pub const fn is_present(self) -> bool {
        self.0 & PRESENT != 0
    }

    pub fn set_present(&mut self, value: bool) {
        set_bit(&mut self.0, PRESENT, value);
    }
}

bitflags::bitflags! {
    /// Page fault error code flags pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u32 {
        /// 1 = protection violation, 0 = not-present page.
        const PRESENT           = 1 << 0;
        /// 1 = write access caused the fault.
        const WRITE             = 1 << 1;
        /// 1 = fault occurred in user mode.
        const USER              = 1 << 2;
        /// 1 = a reserved bit was set in a paging entry.
        const RESERVED_WRITE    = 1 << 3;
        /// 1 = fault was caused by an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// A page fault as delivered by the CPU: error code plus faulting address
/// (CR2).
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    code: PageFaultErrorCode,
    vaddr: VirtAddr,
}

impl PageFault {
    /// Creates a fault record.
    pub const fn new(code: PageFaultErrorCode, vaddr: VirtAddr) -> Self {
        Self { code, vaddr }
    }

    /// Returns the faulting virtual address.
    pub const fn vaddr(self) -> VirtAddr {
        self.vaddr
    }

    /// Returns the raw error code.
    pub const fn code(self) -> PageFaultErrorCode {
        self.code
    }

    /// Returns `true` for a protection violation (page was present).
    pub fn is_protection_violation(self) -> bool {
        self.code.contains(PageFaultErrorCode::PRESENT)
    }

    /// Returns `true` if a write access faulted.
    pub fn is_write(self) -> bool {
        self.code.contains(PageFaultErrorCode::WRITE)
    }

    /// Returns `true` if the fault came from user mode.
    pub fn is_user(self) -> bool {
        self.code.contains(PageFaultErrorCode::USER)
    }

    /// Returns `true` if an instruction fetch faulted.
    pub fn is_instruction_fetch(self) -> bool {
        self.code.contains(PageFaultErrorCode::INSTRUCTION_FETCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::cpuid;

    #[test]
    fn empty_entry_not_present() {
        let entry = PageTableEntry::empty();
        assert!(!entry.is_present());
        assert_eq!(entry.physical_page_base().as_u32(), 0);
    }

    #[test]
    fn pte_base_preserves_flags() {
        let mut entry = PageTableEntry::empty();
        entry.set_present(true);
        entry.set_writable(true);
        entry.set_global(true);
        entry.set_physical_page_base(PhysAddr::new(0x70_3000));
        assert!(entry.is_present());
        assert!(entry.is_writable());
        assert!(entry.is_global());
        assert_eq!(entry.physical_page_base().as_u32(), 0x70_3000);
    }

    #[test]
    fn pte_flags_preserve_base() {
        let mut entry = PageTableEntry::empty();
        entry.set_physical_page_base(PhysAddr::new(0x12_3000));
        entry.set_present(true);
        entry.set_user_allowed(true);
        entry.set_cache_disabled(true);
        entry.set_present(false);
        assert_eq!(entry.physical_page_base().as_u32(), 0x12_3000);
        assert!(entry.is_user_allowed());
        assert!(entry.is_cache_disabled());
        assert!(!entry.is_present());
    }

    #[test]
    fn pte_base_rewrite_clears_only_address_bits() {
        let mut entry = PageTableEntry::empty();
        entry.set_physical_page_base(PhysAddr::new(0xFFFF_F000));
        entry.set_writable(true);
        entry.set_physical_page_base(PhysAddr::new(0x1000));
        assert_eq!(entry.physical_page_base().as_u32(), 0x1000);
        assert!(entry.is_writable());
    }

    #[test]
    fn pde_huge_and_table_base() {
        let mut entry = PageDirectoryEntry::empty();
        entry.set_page_table_base(PhysAddr::new(0x40_0000));
        entry.set_present(true);
        entry.set_huge(true);
        assert!(entry.is_huge());
        assert_eq!(entry.page_table_base().as_u32(), 0x40_0000);
        entry.set_huge(false);
        assert!(!entry.is_huge());
        assert!(entry.is_present());
    }

    #[test]
    fn pdpt_entry_base_and_present() {
        let mut entry = PdptEntry::empty();
        assert!(!entry.is_present());
        entry.set_page_directory_base(PhysAddr::new(0x20_1000));
        entry.set_present(true);
        assert!(entry.is_present());
        assert_eq!(entry.page_directory_base().as_u32(), 0x20_1000);
    }

    #[test]
    fn execute_disable_gated_on_nx_support() {
        let _lock = cpuid::test_lock();

        cpuid::init(CpuFeatures::empty());
        let mut entry = PageTableEntry::empty();
        entry.set_execute_disabled(true);
        assert!(
            !entry.is_execute_disabled(),
            "NX bit must not be set without CPU support"
        );

        cpuid::init(CpuFeatures::NX);
        entry.set_execute_disabled(true);
        assert!(entry.is_execute_disabled());
        entry.set_execute_disabled(false);
        assert!(!entry.is_execute_disabled());

        cpuid::init(CpuFeatures::empty());
    }

    #[test]
    fn fault_code_bits() {
        let code = PageFaultErrorCode::from_bits_truncate(0b00011);
        assert!(code.contains(PageFaultErrorCode::PRESENT));
        assert!(code.contains(PageFaultErrorCode::WRITE));
        assert!(!code.contains(PageFaultErrorCode::USER));
    }

    #[test]
    fn fault_record_accessors() {
        let fault = PageFault::new(
            PageFaultErrorCode::WRITE | PageFaultErrorCode::USER,
            VirtAddr::new(0x0804_8123),
        );
        assert_eq!(fault.vaddr().as_u32(), 0x0804_8123);
        assert!(fault.is_write());
        assert!(fault.is_user());
        assert!(!fault.is_protection_violation());
        assert!(!fault.is_instruction_fetch());
    }
}
