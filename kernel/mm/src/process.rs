//! The process contract the memory manager consumes.
//!
//! The manager needs exactly two things from a process: its page directory
//! and its region list. Fault dispatch also needs to know which process is
//! currently executing; the scheduler maintains that through
//! [`set_current`].

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use meson_core::addr::PhysAddr;
use meson_core::arch::x86::instructions::interrupts::InterruptDisabler;
use meson_core::arch::x86::registers::control::Cr3;
use meson_core::sync::SpinLock;

use crate::manager;
use crate::page_directory::PageDirectory;
use crate::region::Region;

static CURRENT: SpinLock<Option<Arc<Process>>> = SpinLock::new(None);

/// A process, as far as memory management is concerned.
pub struct Process {
    name: String,
    pid: u32,
    page_directory: Arc<PageDirectory>,
    regions: SpinLock<Vec<Arc<Region>>>,
}

impl Process {
    /// Creates a process with its own address space (the kernel gigabyte
    /// shared by reference).
    pub fn new(name: &str, pid: u32) -> Arc<Self> {
        let directory = PageDirectory::new_for_process(&manager::the().kernel_page_directory());
        let process = Arc::new_cyclic(|weak| {
            directory.set_process(weak.clone());
            Self {
                name: String::from(name),
                pid,
                page_directory: directory.clone(),
                regions: SpinLock::new(Vec::new()),
            }
        });
        process
    }

    /// Returns the process name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the process's address space.
    pub fn page_directory(&self) -> &Arc<PageDirectory> {
        &self.page_directory
    }

    /// Adds a region to the process's region list.
    pub fn add_region(&self, region: Arc<Region>) {
        self.regions.lock().push(region);
    }

    /// Removes a region from the process's region list.
    pub fn remove_region(&self, region: &Arc<Region>) {
        self.regions
            .lock()
            .retain(|candidate| !Arc::ptr_eq(candidate, region));
    }

    /// Finds the region covering `vaddr`, if any.
    pub fn region_containing(&self, vaddr: meson_core::addr::VirtAddr) -> Option<Arc<Region>> {
        self.regions
            .lock()
            .iter()
            .find(|region| region.contains(vaddr))
            .cloned()
    }
}

/// Returns the currently executing process.
pub fn current() -> Option<Arc<Process>> {
    CURRENT.lock().clone()
}

/// Installs the currently executing process. Called by the scheduler on
/// every switch.
pub fn set_current(process: Option<Arc<Process>>) {
    *CURRENT.lock() = process;
}

/// Scoped switch into a process's address space.
///
/// Construction records the caller's translation root and loads the target
/// process's; dropping the scope restores the recorded root, on every exit
/// path. Nested scopes behave as a stack.
pub struct ProcessPagingScope {
    previous_root: PhysAddr,
}

impl ProcessPagingScope {
    /// Switches into `process`'s address space.
    pub fn new(process: &Process) -> Self {
        let previous_root = Cr3::read();
        manager::the().enter_process_paging_scope(process);
        Self { previous_root }
    }
}

impl Drop for ProcessPagingScope {
    fn drop(&mut self) {
        let _disabler = InterruptDisabler::new();
        // SAFETY: The recorded root was the live translation root when
        // this scope was entered.
        unsafe { Cr3::write(self.previous_root) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn paging_scope_switches_and_restores() {
        let machine = testing::TestMachine::new();
        let process = Process::new("shell", 1);
        set_current(Some(process.clone()));

        let kernel_root = machine.mm.kernel_page_directory().cr3();
        // SAFETY: Emulated CR3 on the host.
        unsafe { Cr3::write(kernel_root) };

        {
            let _scope = ProcessPagingScope::new(&process);
            assert_eq!(Cr3::read(), process.page_directory().cr3());
        }
        assert_eq!(Cr3::read(), kernel_root);
    }

    #[test]
    fn paging_scopes_nest_like_a_stack() {
        let machine = testing::TestMachine::new();
        let first = Process::new("first", 1);
        let second = Process::new("second", 2);
        set_current(Some(first.clone()));

        let kernel_root = machine.mm.kernel_page_directory().cr3();
        unsafe { Cr3::write(kernel_root) };

        {
            let _outer = ProcessPagingScope::new(&first);
            assert_eq!(Cr3::read(), first.page_directory().cr3());
            {
                let _inner = ProcessPagingScope::new(&second);
                assert_eq!(Cr3::read(), second.page_directory().cr3());
            }
            assert_eq!(Cr3::read(), first.page_directory().cr3());
        }
        assert_eq!(Cr3::read(), kernel_root);
    }

    #[test]
    fn region_list_membership() {
        let machine = testing::TestMachine::new();
        let _ = &machine;
        let process = Process::new("list", 3);
        let region = testing::user_region(&process, 0x0804_8000, 2 * crate::PAGE_SIZE);
        assert!(process
            .region_containing(meson_core::addr::VirtAddr::new(0x0804_8FFF))
            .is_some());
        process.remove_region(&region);
        assert!(process
            .region_containing(meson_core::addr::VirtAddr::new(0x0804_8FFF))
            .is_none());
    }
}
