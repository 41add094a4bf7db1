//! User-mode faults and the kernel/user boundary.

use x86_64::{PhysAddr, VirtAddr};

use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::memory::{pg_round_down, PteFlags, MAXVA, PAGE_SIZE};
use crate::scheduler::Process;

impl Kernel {
    /// Handle a page fault taken by the current process at `va`.
    /// Only addresses inside a mapped region with no page yet are
    /// recoverable; anything else is an unhandled fault.
    pub fn page_fault(&self, va: u64, write: bool) -> KResult<()> {
        let p = self.current();
        if va >= MAXVA {
            return Err(KernelError::UnhandledFault);
        }
        let data = unsafe { p.data_mut() };
        let present = data
            .pagetable
            .as_ref()
            .and_then(|pt| pt.walk(VirtAddr::new(va)))
            .is_some_and(|pte| pte.flags.contains(PteFlags::PRESENT));
        if present {
            log::debug!("page fault: protection violation at {:#x} (write={})", va, write);
            return Err(KernelError::UnhandledFault);
        }
        self.mmap_fault(p, va)
    }

    /// Translate user address `va` for an access, as the MMU would: fault
    /// the page in if needed and mark it accessed (and dirty for stores).
    /// An unhandled fault kills the process.
    fn translate(&self, p: &Process, va: u64, write: bool) -> PhysAddr {
        loop {
            if let Some(pa) = self.user_pte(p, va, write) {
                return pa;
            }
            if let Err(e) = self.page_fault(va, write) {
                log::warn!("usertrap: pid {} {} at {:#x}, killing", p.lock.lock().pid.0, e, va);
                self.setkilled(p);
                self.exit(-1);
            }
        }
    }

    fn user_pte(&self, p: &Process, va: u64, write: bool) -> Option<PhysAddr> {
        if va >= MAXVA {
            return None;
        }
        let data = unsafe { p.data_mut() };
        let pte = data.pagetable.as_mut()?.walk_mut(VirtAddr::new(va))?;
        let mut need = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE;
        if write {
            need |= PteFlags::WRITABLE;
        }
        if !pte.flags.contains(need) {
            return None;
        }
        pte.flags |= PteFlags::ACCESSED;
        if write {
            pte.flags |= PteFlags::DIRTY;
        }
        Some(pte.addr)
    }

    /// User-mode load of `dst.len()` bytes from `va`.
    pub(crate) fn user_load(&self, va: u64, dst: &mut [u8]) {
        let p = self.current();
        let mem = self.kmem.memory();
        let mut done = 0;
        while done < dst.len() {
            let a = self.user_addr(p, va, done);
            let pa = self.translate(p, a, false);
            let offset = (a - pg_round_down(a)) as usize;
            let n = (PAGE_SIZE as usize - offset).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(unsafe { &mem.page(pa)[offset..offset + n] });
            done += n;
        }
    }

    /// User-mode store of `src` at `va`.
    pub(crate) fn user_store(&self, va: u64, src: &[u8]) {
        let p = self.current();
        let mem = self.kmem.memory();
        let mut done = 0;
        while done < src.len() {
            let a = self.user_addr(p, va, done);
            let pa = self.translate(p, a, true);
            let offset = (a - pg_round_down(a)) as usize;
            let n = (PAGE_SIZE as usize - offset).min(src.len() - done);
            unsafe { mem.page_mut(pa)[offset..offset + n].copy_from_slice(&src[done..done + n]) };
            done += n;
        }
    }

    fn user_addr(&self, p: &Process, va: u64, done: usize) -> u64 {
        match va.checked_add(done as u64) {
            Some(a) => a,
            None => {
                self.setkilled(p);
                self.exit(-1)
            }
        }
    }

    /// Kernel/user boundary: a killed process never gets back to user code.
    pub(crate) fn usertrapret(&self) {
        let p = self.current();
        if self.killed(p) {
            self.exit(-1);
        }
    }
}
