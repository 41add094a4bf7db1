use core::cell::UnsafeCell;
use std::sync::Arc;

use x86_64::PhysAddr;

use super::context::Context;
use crate::fs::{File, InodeRef};
use crate::memory::mmap::Vma;
use crate::memory::{PageTable, MMAP_END};
use crate::param::{NMMAP, NOFILE};
use crate::sync::SpinLock;
use crate::syscalls::UserProgram;

/// Unique process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessId(pub u64);

/// Process state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Unused => "unused",
            ProcessState::Used => "used",
            ProcessState::Sleeping => "sleep ",
            ProcessState::Runnable => "runble",
            ProcessState::Running => "run   ",
            ProcessState::Zombie => "zombie",
        }
    }
}

/// Rendezvous key between `sleep` and `wakeup`. Carries no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// A process, by table slot: a parent waiting for its children.
    Proc(usize),
    /// A sleep lock, by address.
    Lock(usize),
    /// Any other kernel object, by address.
    Addr(usize),
}

/// Saved user-mode registers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Fields protected by the process lock.
pub struct ProcInner {
    pub state: ProcessState,
    /// If sleeping, the channel slept on.
    pub chan: Option<Channel>,
    pub killed: bool,
    /// Exit status to be returned to the parent's wait.
    pub xstate: i32,
    pub pid: ProcessId,
    pub name: String,
    /// Switch here to run the process.
    pub(crate) context: Option<Arc<Context>>,
}

/// Fields private to the process: only its own thread touches them once it
/// is running, so no lock is needed.
pub struct ProcData {
    /// Size of process memory (bytes).
    pub sz: u64,
    pub pagetable: Option<PageTable>,
    /// Frame holding the trapframe.
    pub trapframe: Option<PhysAddr>,
    pub ofile: Vec<Option<Arc<File>>>,
    pub cwd: Option<InodeRef>,
    pub vmas: Vec<Option<Vma>>,
    /// Lowest address in use by mappings; the next one goes just below.
    pub mmap_end: u64,
    /// Program run on the first switch into the process.
    pub(crate) entry: Option<UserProgram>,
}

impl ProcData {
    fn new() -> Self {
        ProcData {
            sz: 0,
            pagetable: None,
            trapframe: None,
            ofile: vec![None; NOFILE],
            cwd: None,
            vmas: vec![None; NMMAP],
            mmap_end: MMAP_END,
            entry: None,
        }
    }
}

/// A process table slot.
pub struct Process {
    /// Position in the table; stable for the life of the kernel.
    pub index: usize,
    pub lock: SpinLock<ProcInner>,
    data: UnsafeCell<ProcData>,
}

unsafe impl Sync for Process {}

impl Process {
    pub(crate) fn new(index: usize) -> Self {
        Process {
            index,
            lock: SpinLock::new(
                "proc",
                ProcInner {
                    state: ProcessState::Unused,
                    chan: None,
                    killed: false,
                    xstate: 0,
                    pid: ProcessId(0),
                    name: String::new(),
                    context: None,
                },
            ),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    /// # Safety
    /// The caller must be the process itself, or hold its lock while it is
    /// not running (allocation, fork setup, reaping).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        &mut *self.data.get()
    }

    pub(crate) fn reset_data(&self) {
        // Only reached from freeproc, with the slot locked and not running.
        unsafe { *self.data.get() = ProcData::new() };
    }
}
