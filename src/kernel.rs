use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use x86_64::PhysAddr;

use crate::drivers::RamDisk;
use crate::error::{KResult, KernelError};
use crate::fs::{BufferCache, RamFs};
use crate::memory::{PageAllocator, PhysMemory, KERNBASE};
use crate::param::{KernelConfig, ROOTDEV};
use crate::scheduler::context::spawn_kernel_thread;
use crate::scheduler::cpu::Cpu;
use crate::scheduler::Process;
use crate::serial;
use crate::sync::SpinLock;
use crate::syscalls::UserContext;

/// One booted machine: cores, process table, memory, disk and file system.
pub struct Kernel {
    config: KernelConfig,
    pub(crate) cpus: Box<[Arc<Cpu>]>,
    pub(crate) procs: Box<[Process]>,
    /// Parent of every process slot, by slot. The lock is the global
    /// ordering lock for parent/child relationships: it is taken before any
    /// process lock and keeps wakeups of wait()ing parents from being lost.
    pub(crate) wait_lock: SpinLock<Box<[Option<usize>]>>,
    pub(crate) next_pid: SpinLock<u64>,
    pub(crate) init_slot: AtomicUsize,
    pub(crate) kmem: PageAllocator,
    /// Frame shared by every address space at `TRAMPOLINE`.
    pub(crate) trampoline: PhysAddr,
    disk: Arc<RamDisk>,
    bcache: Arc<BufferCache>,
    fs: Arc<RamFs>,
    started: AtomicBool,
    pub(crate) halted: AtomicBool,
    panic_msg: Mutex<Option<String>>,
    pub(crate) me: Weak<Kernel>,
}

impl Kernel {
    /// Build a machine from `config`. Nothing runs until `start`.
    pub fn new(config: KernelConfig) -> KResult<Arc<Kernel>> {
        config.validate()?;
        serial::init(config.log_level);

        let memory = Arc::new(PhysMemory::new(PhysAddr::new(KERNBASE), config.phys_pages));
        let kmem = PageAllocator::new(memory);
        let trampoline = kmem.allocate_zeroed().ok_or(KernelError::OutOfMemory)?;

        let disk = Arc::new(RamDisk::new(ROOTDEV, config.disk_blocks));
        let bcache = Arc::new(BufferCache::new(disk.clone(), config.nbuf, config.nbuckets));
        let fs = Arc::new(RamFs::new("ramfs", ROOTDEV, config.disk_blocks, bcache.clone()));

        let kernel = Arc::new_cyclic(|me| Kernel {
            cpus: (0..config.ncpu).map(|id| Arc::new(Cpu::new(id, me.clone()))).collect(),
            procs: (0..config.nproc).map(Process::new).collect(),
            wait_lock: SpinLock::new("wait_lock", vec![None; config.nproc].into_boxed_slice()),
            next_pid: SpinLock::new("nextpid", 1),
            init_slot: AtomicUsize::new(usize::MAX),
            kmem,
            trampoline,
            disk,
            bcache,
            fs,
            started: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            panic_msg: Mutex::new(None),
            me: me.clone(),
            config,
        });
        log::info!(
            "atomic_core: {} cpus, {} procs, {} free pages",
            kernel.config.ncpu,
            kernel.config.nproc,
            kernel.kmem.free_frames()
        );
        Ok(kernel)
    }

    /// Create the init process running `init` and start every core's
    /// scheduler.
    pub fn start<F>(self: &Arc<Self>, init: F) -> KResult<()>
    where
        F: FnOnce(&UserContext) -> i32 + Send + 'static,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(KernelError::InvalidArgument);
        }
        self.userinit(Box::new(init))?;

        for cpu in self.cpus.iter() {
            let (kernel, cpu) = (self.clone(), cpu.clone());
            spawn_kernel_thread(format!("cpu{}", cpu.id()), move || kernel.scheduler(cpu))
                .map_err(|_| KernelError::OutOfMemory)?;
        }
        Ok(())
    }

    /// `new` followed by `start`.
    pub fn boot<F>(config: KernelConfig, init: F) -> KResult<Arc<Kernel>>
    where
        F: FnOnce(&UserContext) -> i32 + Send + 'static,
    {
        let kernel = Kernel::new(config)?;
        kernel.start(init)?;
        Ok(kernel)
    }

    /// Stop the scheduler loops. Processes that are running finish their
    /// current stretch; nothing is scheduled afterwards.
    pub fn shutdown(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Message of the panic that halted the kernel, if one did.
    pub fn panic_message(&self) -> Option<String> {
        self.panic_msg.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn record_panic(&self, message: String) {
        log::error!("kernel panic: {}", message);
        self.panic_msg
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(message);
        self.shutdown();
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn kmem(&self) -> &PageAllocator {
        &self.kmem
    }

    pub fn memory(&self) -> &Arc<PhysMemory> {
        self.kmem.memory()
    }

    pub fn disk(&self) -> &Arc<RamDisk> {
        &self.disk
    }

    pub fn bcache(&self) -> &Arc<BufferCache> {
        &self.bcache
    }

    pub fn fs(&self) -> &Arc<RamFs> {
        &self.fs
    }

    pub fn cpus(&self) -> &[Arc<Cpu>] {
        &self.cpus
    }
}

/// Text of a panic payload.
pub(crate) fn panic_text(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}
