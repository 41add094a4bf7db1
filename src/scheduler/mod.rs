pub mod context;
pub mod cpu;
pub mod process;
pub mod task;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::interrupts::{intr_get, intr_on, pop_off, push_off};
use crate::kernel::{panic_text, Kernel};
use crate::sync::SpinLockGuard;
use context::swtch;
use cpu::{mycpu, set_this_cpu, Cpu};
pub use task::{Channel, ProcInner, Process, ProcessId, ProcessState, TrapFrame};

/// One line of `procdump` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: ProcessId,
    pub state: ProcessState,
    pub name: String,
}

impl Kernel {
    /// The process running on this core, if any.
    pub fn myproc(&self) -> Option<&Process> {
        push_off();
        let slot = mycpu().proc();
        pop_off();
        slot.map(|i| &self.procs[i])
    }

    /// The running process; kernel code on a process path always has one.
    pub(crate) fn current(&self) -> &Process {
        match self.myproc() {
            Some(p) => p,
            None => panic!("myproc: no current process"),
        }
    }

    /// Per-core process scheduler.
    /// Each core calls `scheduler` after setting itself up; it never returns
    /// until the kernel halts. It loops, doing:
    ///  - choose a process to run.
    ///  - swtch to start running that process.
    ///  - eventually that process transfers control via swtch back to the
    ///    scheduler.
    pub(crate) fn scheduler(&self, cpu: Arc<Cpu>) {
        set_this_cpu(cpu.clone());
        cpu.set_proc(None);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            while !self.halted.load(Ordering::Acquire) {
                // The most recent process to run may have had interrupts
                // turned off; enable them to avoid a deadlock if all
                // processes are waiting.
                intr_on();

                let mut found = false;
                for p in self.procs.iter() {
                    let mut inner = p.lock.lock();
                    if inner.state == ProcessState::Runnable {
                        // Switch to chosen process. It is the process's job
                        // to release its lock and then reacquire it before
                        // jumping back to us.
                        inner.state = ProcessState::Running;
                        cpu.set_proc(Some(p.index));
                        let Some(ctx) = inner.context.clone() else {
                            panic!("scheduler: runnable process without context");
                        };
                        swtch(&cpu.context, &ctx);

                        // Process is done running for now.
                        cpu.set_proc(None);
                        found = true;
                    }
                }
                if !found {
                    context::relax();
                }
            }
        }));

        match result {
            Ok(()) => log::debug!("cpu{}: halted", cpu.id()),
            Err(payload) => self.record_panic(panic_text(&payload)),
        }
    }

    /// Switch to scheduler. Must hold only `p.lock` and have changed
    /// `p.state`. Saves and restores `intena` because `intena` is a property
    /// of this kernel thread, not this core.
    pub(crate) fn sched(&self, p: &Process, inner: &SpinLockGuard<'_, ProcInner>) {
        let cpu = mycpu();

        if !p.lock.holding() {
            panic!("sched p->lock");
        }
        if cpu.noff() != 1 {
            panic!("sched locks");
        }
        if inner.state == ProcessState::Running {
            panic!("sched running");
        }
        if intr_get() {
            panic!("sched interruptible");
        }
        let Some(ctx) = inner.context.clone() else {
            panic!("sched: no context");
        };

        let intena = cpu.intena();
        let scheduler = cpu.context.clone();
        drop(cpu);
        swtch(&ctx, &scheduler);
        mycpu().set_intena(intena);
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_now(&self) {
        let p = self.current();
        let mut inner = p.lock.lock();
        inner.state = ProcessState::Runnable;
        self.sched(p, &inner);
    }

    /// Atomically release `guard`'s lock and sleep on `chan`.
    /// Reacquires the lock when awakened.
    pub fn sleep<'a, T: ?Sized>(&self, chan: Channel, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let p = self.current();

        // Must acquire p.lock in order to change p.state and then call
        // sched. Once we hold p.lock, we can be guaranteed that we won't
        // miss any wakeup (wakeup locks p.lock), so it's okay to release
        // the condition lock.
        let mut inner = p.lock.lock();
        let lock = SpinLockGuard::unlock(guard);

        inner.chan = Some(chan);
        inner.state = ProcessState::Sleeping;

        self.sched(p, &inner);

        // Tidy up.
        inner.chan = None;

        // Reacquire original lock.
        drop(inner);
        lock.lock()
    }

    /// Wake up all processes sleeping on `chan`.
    /// Must be called without any process lock.
    pub fn wakeup(&self, chan: Channel) {
        let me = self.myproc().map(|p| p.index);
        for p in self.procs.iter() {
            if Some(p.index) == me {
                continue;
            }
            let mut inner = p.lock.lock();
            if inner.state == ProcessState::Sleeping && inner.chan == Some(chan) {
                inner.state = ProcessState::Runnable;
            }
        }
    }

    /// Kill the process with the given pid.
    /// The victim won't exit until it tries to return to user space.
    pub fn kill(&self, pid: ProcessId) -> crate::KResult<()> {
        for p in self.procs.iter() {
            let mut inner = p.lock.lock();
            if inner.pid == pid && inner.state != ProcessState::Unused {
                inner.killed = true;
                if inner.state == ProcessState::Sleeping {
                    // Wake process from sleep().
                    inner.state = ProcessState::Runnable;
                }
                log::debug!("kill: pid {} ({})", pid.0, inner.name);
                return Ok(());
            }
        }
        Err(crate::KernelError::NoSuchProcess)
    }

    pub fn setkilled(&self, p: &Process) {
        p.lock.lock().killed = true;
    }

    pub fn killed(&self, p: &Process) -> bool {
        p.lock.lock().killed
    }

    /// Snapshot of every live process slot, in table order.
    pub fn procdump(&self) -> Vec<ProcInfo> {
        let mut result = Vec::new();
        for p in self.procs.iter() {
            let inner = p.lock.lock();
            if inner.state == ProcessState::Unused {
                continue;
            }
            result.push(ProcInfo { pid: inner.pid, state: inner.state, name: inner.name.clone() });
        }
        for info in &result {
            log::info!("{} {} {}", info.pid.0, info.state.as_str(), info.name);
        }
        result
    }
}

/// Sleep on `chan`, releasing `guard` meanwhile.
///
/// From a thread that is not a kernel process (a plain host thread using
/// kernel primitives) there is no process to block, so the lock is dropped
/// and retaken after a pause; callers re-check their condition in a loop
/// either way.
pub fn sleep<'a, T: ?Sized>(chan: Channel, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    match mycpu().kernel() {
        Some(kernel) if kernel.myproc().is_some() => kernel.sleep(chan, guard),
        _ => {
            let lock = SpinLockGuard::unlock(guard);
            std::thread::yield_now();
            lock.lock()
        }
    }
}

/// Wake sleepers on `chan` in the current core's kernel, if any.
pub fn wakeup(chan: Channel) {
    if let Some(kernel) = mycpu().kernel() {
        kernel.wakeup(chan);
    }
}
