use core::fmt;

/// Recoverable kernel errors, reported back to the caller of a syscall.
///
/// Broken invariants are not represented here: those panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    NoFreeProcess,
    NoChildren,
    NoSuchProcess,
    Killed,
    InvalidArgument,
    BadFileDescriptor,
    PermissionDenied,
    NoFreeMapping,
    UnsupportedSplit,
    BadAddress,
    IoError,
    NoSpace,
    UnhandledFault,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "Out of memory"),
            KernelError::NoFreeProcess => write!(f, "Process table full"),
            KernelError::NoChildren => write!(f, "No child processes"),
            KernelError::NoSuchProcess => write!(f, "No such process"),
            KernelError::Killed => write!(f, "Process killed"),
            KernelError::InvalidArgument => write!(f, "Invalid argument"),
            KernelError::BadFileDescriptor => write!(f, "Bad file descriptor"),
            KernelError::PermissionDenied => write!(f, "Permission denied"),
            KernelError::NoFreeMapping => write!(f, "No free mapping slot"),
            KernelError::UnsupportedSplit => write!(f, "Cannot unmap the middle of a region"),
            KernelError::BadAddress => write!(f, "Bad address"),
            KernelError::IoError => write!(f, "I/O error"),
            KernelError::NoSpace => write!(f, "No space left"),
            KernelError::UnhandledFault => write!(f, "Unhandled page fault"),
        }
    }
}

pub type KResult<T> = Result<T, KernelError>;
