use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use super::context::Context;
use crate::kernel::Kernel;

const NO_PROC: usize = usize::MAX;

static NEXT_UID: AtomicUsize = AtomicUsize::new(1);

/// Per-core state.
///
/// Every field is only ever written by the thread currently running on this
/// core, so relaxed atomics are enough; they exist to make the record `Sync`.
pub struct Cpu {
    id: usize,
    /// Process-wide unique id, used as the owner tag of spin locks.
    uid: usize,
    kernel: Weak<Kernel>,
    /// Slot of the process running on this core, or `NO_PROC`.
    proc: AtomicUsize,
    /// The scheduler loop's saved context.
    pub(crate) context: Arc<Context>,
    /// Depth of `push_off` nesting.
    noff: AtomicUsize,
    /// Were interrupts enabled before the outermost `push_off`?
    intena: AtomicBool,
    /// Simulated interrupt-enable flag.
    intr: AtomicBool,
}

impl Cpu {
    pub(crate) fn new(id: usize, kernel: Weak<Kernel>) -> Self {
        Cpu {
            id,
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            kernel,
            proc: AtomicUsize::new(NO_PROC),
            context: Context::new(),
            noff: AtomicUsize::new(0),
            intena: AtomicBool::new(false),
            intr: AtomicBool::new(false),
        }
    }

    /// Record for a host thread that is not one of the kernel's cores.
    /// Lets the lock primitives be used from plain threads.
    fn detached() -> Self {
        let cpu = Cpu::new(usize::MAX, Weak::new());
        cpu.intr.store(true, Ordering::Relaxed);
        cpu
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn uid(&self) -> usize {
        self.uid
    }

    /// The kernel this core belongs to, `None` for detached records.
    pub fn kernel(&self) -> Option<Arc<Kernel>> {
        self.kernel.upgrade()
    }

    /// Process-table slot of the process running here.
    pub fn proc(&self) -> Option<usize> {
        match self.proc.load(Ordering::Relaxed) {
            NO_PROC => None,
            slot => Some(slot),
        }
    }

    pub(crate) fn set_proc(&self, slot: Option<usize>) {
        self.proc.store(slot.unwrap_or(NO_PROC), Ordering::Relaxed);
    }

    pub fn noff(&self) -> usize {
        self.noff.load(Ordering::Relaxed)
    }

    pub(crate) fn set_noff(&self, depth: usize) {
        self.noff.store(depth, Ordering::Relaxed);
    }

    pub fn intena(&self) -> bool {
        self.intena.load(Ordering::Relaxed)
    }

    pub(crate) fn set_intena(&self, enabled: bool) {
        self.intena.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn interrupts_enabled(&self) -> bool {
        self.intr.load(Ordering::Relaxed)
    }

    pub(crate) fn set_interrupts(&self, enabled: bool) {
        self.intr.store(enabled, Ordering::Relaxed);
    }
}

thread_local! {
    static THIS_CPU: RefCell<Option<Arc<Cpu>>> = const { RefCell::new(None) };
}

/// The core the calling thread is running on.
///
/// Callers that need a stable answer must have interrupts off (hold a spin
/// lock or be inside `push_off`): a process can move to another core at any
/// `sched`.
pub fn mycpu() -> Arc<Cpu> {
    THIS_CPU.with(|slot| {
        slot.borrow_mut()
            .get_or_insert_with(|| Arc::new(Cpu::detached()))
            .clone()
    })
}

/// Owner tag of the current core, without cloning the record.
pub(crate) fn cpu_uid() -> usize {
    THIS_CPU.with(|slot| {
        slot.borrow_mut()
            .get_or_insert_with(|| Arc::new(Cpu::detached()))
            .uid
    })
}

/// Bind the calling thread to `cpu`. Done by the scheduler thread at start and
/// by a process thread each time it is switched in.
pub(crate) fn set_this_cpu(cpu: Arc<Cpu>) {
    THIS_CPU.with(|slot| *slot.borrow_mut() = Some(cpu));
}

/// Index of the current core.
pub fn cpuid() -> usize {
    mycpu().id()
}
