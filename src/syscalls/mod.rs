use std::sync::Arc;

use x86_64::VirtAddr;

use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;
use crate::memory::mmap::Prot;
use crate::scheduler::{ProcessId, TrapFrame};

/// Syscall numbers (passed in RAX from userland).
pub const SYS_EXIT: u64 = 0;
pub const SYS_YIELD: u64 = 2;
pub const SYS_GETPID: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_KILL: u64 = 5;
pub const SYS_SBRK: u64 = 6;
pub const SYS_MMAP: u64 = 7;
pub const SYS_MUNMAP: u64 = 8;
pub const SYS_CLOSE: u64 = 9;

/// A user program: runs as a process and returns its exit status.
pub type UserProgram = Box<dyn FnOnce(&UserContext) -> i32 + Send + 'static>;

/// What a running user program sees of the machine: the system calls of
/// its own process and user-mode memory access.
///
/// Every call returns through the kernel/user boundary, where a process
/// that has been killed exits instead of getting back to user code.
pub struct UserContext {
    kernel: Arc<Kernel>,
}

impl UserContext {
    pub(crate) fn new(kernel: Arc<Kernel>) -> Self {
        UserContext { kernel }
    }

    /// Enter user mode for the first time.
    pub(crate) fn run(&self, program: UserProgram) -> i32 {
        self.kernel.usertrapret();
        program(self)
    }

    fn ret<T>(&self, value: T) -> T {
        self.kernel.usertrapret();
        value
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn getpid(&self) -> ProcessId {
        let pid = self.kernel.current().lock.lock().pid;
        self.ret(pid)
    }

    /// Fork; the child runs `child` and exits with its result.
    pub fn fork<F>(&self, child: F) -> KResult<ProcessId>
    where
        F: FnOnce(&UserContext) -> i32 + Send + 'static,
    {
        let pid = self.kernel.fork(Box::new(child));
        self.ret(pid)
    }

    pub fn exit(&self, status: i32) -> ! {
        self.kernel.exit(status)
    }

    /// Wait for a child; the exit status is stored at `addr` if given.
    pub fn wait(&self, addr: Option<VirtAddr>) -> KResult<ProcessId> {
        let pid = self.kernel.wait(addr);
        self.ret(pid)
    }

    pub fn kill(&self, pid: ProcessId) -> KResult<()> {
        let r = self.kernel.kill(pid);
        self.ret(r)
    }

    pub fn yield_now(&self) {
        self.kernel.yield_now();
        self.ret(())
    }

    /// Grow (or shrink) the heap by `n` bytes; returns the old break.
    pub fn sbrk(&self, n: i64) -> KResult<u64> {
        let r = self.kernel.growproc(n);
        self.ret(r)
    }

    pub fn open(&self, path: &str, omode: u32) -> KResult<usize> {
        let r = self.kernel.open(path, omode);
        self.ret(r)
    }

    pub fn close(&self, fd: usize) -> KResult<()> {
        let r = self.kernel.close(fd);
        self.ret(r)
    }

    pub fn mmap(&self, length: u64, prot: Prot, flags: u32, fd: usize) -> KResult<VirtAddr> {
        let r = self.kernel.mmap(length, prot.bits(), flags, fd);
        self.ret(r)
    }

    pub fn munmap(&self, addr: VirtAddr, length: u64) -> KResult<()> {
        let r = self.kernel.munmap(addr, length);
        self.ret(r)
    }

    /// Read user memory. Faults like a user-mode load would.
    pub fn load(&self, va: u64, dst: &mut [u8]) {
        self.kernel.user_load(va, dst);
    }

    /// Write user memory. Faults like a user-mode store would.
    pub fn store(&self, va: u64, src: &[u8]) {
        self.kernel.user_store(va, src);
    }

    /// The process's saved user registers.
    pub fn trapframe(&self) -> TrapFrame {
        let p = self.kernel.current();
        unsafe { *self.kernel.trapframe(p.data_mut()) }
    }

    /// Trap into the kernel by number, as `int 0x80` would.
    pub fn syscall(&self, number: u64, args: [u64; 4]) -> u64 {
        let r = dispatch(&self.kernel, number, args);
        self.ret(r)
    }
}

/// Central syscall dispatcher.
/// Arguments come from registers: rdi=arg0, rsi=arg1, rdx=arg2, r10=arg3.
/// Returns result in rax, `u64::MAX` on error.
pub fn dispatch(kernel: &Kernel, number: u64, args: [u64; 4]) -> u64 {
    let result = match number {
        SYS_EXIT => kernel.exit(args[0] as i32),
        SYS_YIELD => {
            kernel.yield_now();
            Ok(0)
        }
        SYS_GETPID => Ok(kernel.current().lock.lock().pid.0),
        SYS_WAIT => {
            let addr = VirtAddr::try_new(args[0]).ok().filter(|a| a.as_u64() != 0);
            kernel.wait(addr).map(|pid| pid.0)
        }
        SYS_KILL => kernel.kill(ProcessId(args[0])).map(|()| 0),
        SYS_SBRK => kernel.growproc(args[0] as i64),
        SYS_MMAP => sys_mmap(kernel, args),
        SYS_MUNMAP => match VirtAddr::try_new(args[0]) {
            Ok(addr) => kernel.munmap(addr, args[1]).map(|()| 0),
            Err(_) => Err(KernelError::InvalidArgument),
        },
        SYS_CLOSE => usize::try_from(args[0])
            .map_err(|_| KernelError::BadFileDescriptor)
            .and_then(|fd| kernel.close(fd))
            .map(|()| 0),
        _ => {
            log::warn!("syscall: unknown number {}", number);
            return u64::MAX;
        }
    };
    result.unwrap_or_else(|e| {
        log::debug!("syscall {}: {}", number, e);
        u64::MAX
    })
}

/// Register values that do not fit the argument's type are rejected, never
/// truncated.
fn sys_mmap(kernel: &Kernel, args: [u64; 4]) -> KResult<u64> {
    let prot = u32::try_from(args[1]).map_err(|_| KernelError::InvalidArgument)?;
    let flags = u32::try_from(args[2]).map_err(|_| KernelError::InvalidArgument)?;
    let fd = usize::try_from(args[3]).map_err(|_| KernelError::BadFileDescriptor)?;
    kernel.mmap(args[0], prot, flags, fd).map(|va| va.as_u64())
}
