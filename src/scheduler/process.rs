//! Process lifecycle: allocation, fork, exit, wait and reparenting.

use core::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use x86_64::{PhysAddr, VirtAddr};

use super::context::{self, Context, Reaped};
use super::task::{Channel, ProcData, ProcInner, Process, ProcessId, ProcessState, TrapFrame};
use crate::error::{KResult, KernelError};
use crate::fs::file::default_fd_table;
use crate::fs::FileSystem;
use crate::kernel::{panic_text, Kernel};
use crate::memory::{PageTable, PteFlags, PAGE_SIZE, TRAMPOLINE, TRAPFRAME};
use crate::sync::SpinLockGuard;
use crate::syscalls::{UserContext, UserProgram};

impl Kernel {
    fn allocpid(&self) -> ProcessId {
        let mut next = self.next_pid.lock();
        let pid = *next;
        *next += 1;
        ProcessId(pid)
    }

    /// Look in the process table for an UNUSED proc. If found, initialize
    /// the state required to run in the kernel and return with `p.lock`
    /// held. Fails if there are no free procs or a memory allocation fails.
    pub(crate) fn allocproc(&self) -> KResult<(&Process, SpinLockGuard<'_, ProcInner>)> {
        for p in self.procs.iter() {
            let mut inner = p.lock.lock();
            if inner.state != ProcessState::Unused {
                continue;
            }
            inner.pid = self.allocpid();
            inner.state = ProcessState::Used;

            // 1. Allocate a trapframe page.
            let data = unsafe { p.data_mut() };
            let Some(tf) = self.kmem.allocate_zeroed() else {
                log::warn!("allocproc: out of memory for trapframe");
                self.freeproc(p, &mut inner);
                return Err(KernelError::OutOfMemory);
            };
            data.trapframe = Some(tf);

            // 2. An empty user page table.
            match self.proc_pagetable(tf) {
                Some(pt) => data.pagetable = Some(pt),
                None => {
                    log::warn!("allocproc: out of memory for page table");
                    self.freeproc(p, &mut inner);
                    return Err(KernelError::OutOfMemory);
                }
            }

            // 3. A kernel thread that starts executing at forkret.
            let ctx = Context::new();
            let (kernel, thread_ctx) = (self.me.clone(), ctx.clone());
            let spawned = context::spawn_kernel_thread(format!("pid{}", inner.pid.0), move || {
                process_main(kernel, thread_ctx)
            });
            if let Err(e) = spawned {
                log::error!("allocproc: cannot start kernel thread: {}", e);
                self.freeproc(p, &mut inner);
                return Err(KernelError::NoFreeProcess);
            }
            inner.context = Some(ctx);

            return Ok((p, inner));
        }
        Err(KernelError::NoFreeProcess)
    }

    /// Free a proc structure and the data hanging from it, including user
    /// pages. `p.lock` must be held.
    pub(crate) fn freeproc(&self, p: &Process, inner: &mut ProcInner) {
        let data = unsafe { p.data_mut() };
        if let Some(tf) = data.trapframe.take() {
            self.kmem.free(tf);
        }
        if let Some(pt) = data.pagetable.take() {
            pt.free(&self.kmem);
        }
        p.reset_data();

        inner.pid = ProcessId(0);
        inner.name.clear();
        inner.chan = None;
        inner.killed = false;
        inner.xstate = 0;
        inner.state = ProcessState::Unused;
        if let Some(ctx) = inner.context.take() {
            ctx.reap();
        }
    }

    /// Create a user page table for a given process, with no user memory,
    /// but with the trampoline and trapframe pages.
    fn proc_pagetable(&self, trapframe: PhysAddr) -> Option<PageTable> {
        let mut pt = PageTable::new(&self.kmem)?;

        // The trampoline is only used by the kernel on the way to and
        // from user space, so not USER_ACCESSIBLE.
        let mapped = pt
            .map_shared(&self.kmem, VirtAddr::new(TRAMPOLINE), self.trampoline, PteFlags::empty())
            .and_then(|()| {
                pt.map_shared(
                    &self.kmem,
                    VirtAddr::new(TRAPFRAME),
                    trapframe,
                    PteFlags::WRITABLE | PteFlags::NO_EXECUTE,
                )
            });
        if mapped.is_err() {
            pt.free(&self.kmem);
            return None;
        }
        Some(pt)
    }

    /// The saved user registers of `p`.
    ///
    /// # Safety
    /// Same contract as `Process::data_mut`.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn trapframe(&self, data: &ProcData) -> &mut TrapFrame {
        match data.trapframe {
            Some(tf) => self.kmem.memory().as_mut::<TrapFrame>(tf),
            None => panic!("trapframe: process has none"),
        }
    }

    /// Set up the first user process.
    pub(crate) fn userinit(&self, program: UserProgram) -> KResult<()> {
        let (p, mut inner) = self.allocproc()?;
        let data = unsafe { p.data_mut() };

        // One page of user memory, like the initcode image.
        let grown = match data.pagetable.as_mut() {
            Some(pt) => pt.uvm_alloc(&self.kmem, 0, PAGE_SIZE, PteFlags::WRITABLE),
            None => Err(KernelError::OutOfMemory),
        };
        if let Err(e) = grown {
            self.freeproc(p, &mut inner);
            return Err(e);
        }
        data.sz = PAGE_SIZE;

        // Prepare for the very first "return" from kernel to user.
        let tf = unsafe { self.trapframe(data) };
        tf.rip = 0;
        tf.rsp = PAGE_SIZE;

        inner.name = String::from("initcode");
        data.cwd = Some(self.fs().root());
        data.ofile = default_fd_table();
        data.entry = Some(program);

        self.init_slot.store(p.index, core::sync::atomic::Ordering::Release);
        inner.state = ProcessState::Runnable;
        log::info!("userinit: pid {} in slot {}", inner.pid.0, p.index);
        Ok(())
    }

    /// Table slot of the init process.
    pub(crate) fn init_slot(&self) -> Option<usize> {
        match self.init_slot.load(core::sync::atomic::Ordering::Acquire) {
            usize::MAX => None,
            slot => Some(slot),
        }
    }

    /// Create a new process, copying the parent. The child starts in
    /// `child_main` with the parent's registers, except that its return
    /// value register is 0.
    pub fn fork(&self, child_main: UserProgram) -> KResult<ProcessId> {
        let p = self.current();
        let name = p.lock.lock().name.clone();
        let pdata = unsafe { p.data_mut() };

        // Allocate process.
        let (np, mut ninner) = self.allocproc()?;
        let ndata = unsafe { np.data_mut() };

        // Copy user memory, then the pages of mapped regions that have
        // already been faulted in, from parent to child.
        let copied = match (pdata.pagetable.as_ref(), ndata.pagetable.as_mut()) {
            (Some(ppt), Some(npt)) => ppt.uvm_copy(npt, &self.kmem, 0, pdata.sz, false).and_then(|()| {
                pdata.vmas.iter().flatten().try_for_each(|vma| {
                    ppt.uvm_copy(npt, &self.kmem, vma.addr.as_u64(), vma.end(), true)
                })
            }),
            _ => Err(KernelError::OutOfMemory),
        };
        if let Err(e) = copied {
            log::warn!("fork: copying address space of pid {} failed: {}", ninner.pid.0, e);
            self.freeproc(np, &mut ninner);
            return Err(e);
        }
        ndata.sz = pdata.sz;

        // Copy saved user registers; fork returns 0 in the child.
        unsafe {
            let tf = *self.trapframe(pdata);
            let ntf = self.trapframe(ndata);
            *ntf = tf;
            ntf.rax = 0;
        }

        // Increment reference counts on open file descriptors, the working
        // directory and the files behind mapped regions.
        ndata.ofile = pdata.ofile.clone();
        ndata.cwd = pdata.cwd.clone();
        ndata.vmas = pdata.vmas.clone();
        ndata.mmap_end = pdata.mmap_end;
        ndata.entry = Some(child_main);

        ninner.name = name;
        let pid = ninner.pid;
        drop(ninner);

        self.wait_lock.lock()[np.index] = Some(p.index);

        np.lock.lock().state = ProcessState::Runnable;
        log::debug!("fork: pid {} created", pid.0);
        Ok(pid)
    }

    /// Pass `p`'s abandoned children to init.
    /// Caller must hold `wait_lock`, whose data is `parents`.
    pub(crate) fn reparent(&self, p: &Process, parents: &mut [Option<usize>]) {
        debug_assert!(self.wait_lock.holding());
        let Some(init) = self.init_slot() else {
            return;
        };
        for slot in 0..parents.len() {
            if parents[slot] == Some(p.index) {
                parents[slot] = Some(init);
                self.wakeup(Channel::Proc(init));
            }
        }
    }

    /// Exit the current process. Does not return.
    /// An exited process remains in the zombie state until its parent
    /// calls wait().
    pub fn exit(&self, status: i32) -> ! {
        let p = self.current();

        if Some(p.index) == self.init_slot() {
            panic!("init exiting");
        }

        // 1. Write back and drop every mapped region.
        self.unmap_all(p);

        // 2. Close all open files.
        let data = unsafe { p.data_mut() };
        for file in data.ofile.iter_mut() {
            file.take();
        }

        let fs = self.fs();
        fs.begin_op();
        data.cwd.take();
        fs.end_op();

        let mut parents = self.wait_lock.lock();

        // 3. Give any children to init.
        self.reparent(p, &mut parents);

        // 4. Parent might be sleeping in wait().
        if let Some(parent) = parents[p.index] {
            self.wakeup(Channel::Proc(parent));
        }

        // The scheduler releases this lock once we are off the core; the
        // guard must never run.
        let mut inner = ManuallyDrop::new(p.lock.lock());
        inner.xstate = status;
        inner.state = ProcessState::Zombie;
        log::debug!("exit: pid {} status {}", inner.pid.0, status);

        drop(parents);

        // Jump into the scheduler, never to return.
        self.sched(p, &inner);
        panic!("zombie exit");
    }

    /// Wait for a child process to exit and return its pid.
    /// If `addr` is given, the exit status is copied there.
    pub fn wait(&self, addr: Option<VirtAddr>) -> KResult<ProcessId> {
        let p = self.current();
        let mut parents = self.wait_lock.lock();

        loop {
            // Scan through table looking for exited children.
            let mut havekids = false;
            for pp in self.procs.iter() {
                if parents[pp.index] != Some(p.index) {
                    continue;
                }
                // make sure the child isn't still in exit() or swtch().
                let mut child = pp.lock.lock();
                havekids = true;
                if child.state != ProcessState::Zombie {
                    continue;
                }

                let pid = child.pid;
                if let Some(addr) = addr {
                    let data = unsafe { p.data_mut() };
                    let status = child.xstate.to_le_bytes();
                    let copied = match data.pagetable.as_mut() {
                        Some(pt) => pt.copy_out(self.kmem.memory(), addr, &status),
                        None => Err(KernelError::BadAddress),
                    };
                    copied?;
                }
                parents[pp.index] = None;
                self.freeproc(pp, &mut child);
                return Ok(pid);
            }

            // No point waiting if we don't have any children.
            if !havekids {
                return Err(KernelError::NoChildren);
            }
            if self.killed(p) {
                return Err(KernelError::Killed);
            }

            // Wait for a child to exit.
            parents = self.sleep(Channel::Proc(p.index), parents);
        }
    }

    /// Grow or shrink user memory by `n` bytes. Returns the old size.
    pub fn growproc(&self, n: i64) -> KResult<u64> {
        let p = self.current();
        let data = unsafe { p.data_mut() };
        let sz = data.sz;
        let Some(pt) = data.pagetable.as_mut() else {
            return Err(KernelError::OutOfMemory);
        };

        let new = if n > 0 {
            let target = sz.checked_add(n as u64).ok_or(KernelError::OutOfMemory)?;
            // The heap may not run into the mapped regions.
            if target > data.mmap_end {
                return Err(KernelError::OutOfMemory);
            }
            pt.uvm_alloc(&self.kmem, sz, target, PteFlags::WRITABLE)?
        } else if n < 0 {
            let shrink = n.unsigned_abs();
            if shrink > sz {
                return Err(KernelError::InvalidArgument);
            }
            pt.uvm_dealloc(&self.kmem, sz, sz - shrink)
        } else {
            sz
        };
        data.sz = new;
        Ok(sz)
    }

    /// A fork child's very first scheduling by the scheduler will swtch
    /// here, still holding `p.lock`.
    fn forkret(self: &Arc<Self>) {
        let p = self.current();
        unsafe { p.lock.force_unlock() };

        let program = unsafe { p.data_mut() }.entry.take();
        let user = UserContext::new(self.clone());
        let status = match program {
            Some(program) => user.run(program),
            None => 0,
        };
        user.exit(status);
    }
}

/// Body of every process's kernel thread.
fn process_main(kernel: Weak<Kernel>, ctx: Arc<Context>) {
    if !context::wait_first_run(&ctx) {
        return;
    }
    drop(ctx);
    let Some(kernel) = kernel.upgrade() else {
        return;
    };

    let result = panic::catch_unwind(AssertUnwindSafe(|| kernel.forkret()));
    if let Err(payload) = result {
        if payload.is::<Reaped>() {
            return;
        }
        kernel.record_panic(panic_text(&payload));
    }
}
