//! User pointer validation for system calls.
//!
//! A syscall argument is only as trustworthy as the regions that cover it.
//! Validation walks the requested range page by page and proves that every
//! page is covered by a region with the required rights; the covering
//! region is reused while it still contains the next page, so a large
//! range inside one region costs one lookup.
//!
//! Callers run validation from syscall entry with the process's region
//! list stable (interrupts disabled on this machine). A failed validation
//! is not a kernel error: the syscall fails with a permission error.

use meson_core::addr::VirtAddr;

use crate::manager::MemoryManager;
use crate::process::Process;
use crate::region::Region;
use crate::{is_user_address, PAGE_SIZE};

use alloc::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessSpace {
    Kernel,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessType {
    Read,
    Write,
}

impl MemoryManager {
    fn validate_range(
        &self,
        space: AccessSpace,
        access: AccessType,
        process: &Process,
        base: VirtAddr,
        size: usize,
    ) -> bool {
        assert!(size != 0, "validating an empty range");
        let mut vaddr = base.page_base();
        let end_vaddr = base.offset(size - 1).page_base();
        if end_vaddr < vaddr {
            // The range wraps around the top of the address space.
            return false;
        }

        let mut region: Option<Arc<Region>> = None;
        loop {
            let covered = region.as_ref().is_some_and(|r| r.contains(vaddr));
            if !covered {
                region = if space == AccessSpace::Kernel {
                    self.kernel_region_from_vaddr(vaddr)
                } else {
                    None
                };
                if region.is_none() {
                    region = Self::user_region_from_vaddr(process, vaddr);
                }
                let Some(found) = region.as_ref() else {
                    return false;
                };
                if space == AccessSpace::User && !found.is_user_accessible() {
                    return false;
                }
                if access == AccessType::Read && !found.is_readable() {
                    return false;
                }
                if access == AccessType::Write && !found.is_writable() {
                    return false;
                }
            }
            if vaddr == end_vaddr {
                return true;
            }
            vaddr = vaddr.offset(PAGE_SIZE);
        }
    }

    /// Proves that `[vaddr, vaddr + size)` is readable user memory of
    /// `process`.
    pub fn validate_user_read(&self, process: &Process, vaddr: VirtAddr, size: usize) -> bool {
        if !is_user_address(vaddr) {
            return false;
        }
        self.validate_range(AccessSpace::User, AccessType::Read, process, vaddr, size)
    }

    /// Proves that `[vaddr, vaddr + size)` is writable user memory of
    /// `process`.
    pub fn validate_user_write(&self, process: &Process, vaddr: VirtAddr, size: usize) -> bool {
        if !is_user_address(vaddr) {
            return false;
        }
        self.validate_range(AccessSpace::User, AccessType::Write, process, vaddr, size)
    }

    /// Proves that `[vaddr, vaddr + size)` is readable from kernel mode.
    pub fn validate_kernel_read(&self, process: &Process, vaddr: VirtAddr, size: usize) -> bool {
        self.validate_range(AccessSpace::Kernel, AccessType::Read, process, vaddr, size)
    }

    /// Proves that `vaddr` lies in a user-accessible stack region of
    /// `process`.
    pub fn validate_user_stack(&self, process: &Process, vaddr: VirtAddr) -> bool {
        if !is_user_address(vaddr) {
            return false;
        }
        Self::user_region_from_vaddr(process, vaddr)
            .is_some_and(|region| region.is_user_accessible() && region.is_stack())
    }
}
