//! Multicore process, memory-mapping and block-cache core of the AtomicOS
//! kernel, running hosted: cores and processes are host threads.

pub mod drivers;
pub mod error;
pub mod fs;
pub mod interrupts;
pub mod kernel;
pub mod memory;
pub mod param;
pub mod scheduler;
pub mod serial;
pub mod sync;
pub mod syscalls;

#[cfg(test)]
mod tests;

pub use error::{KResult, KernelError};
pub use kernel::Kernel;
pub use param::KernelConfig;
pub use syscalls::UserContext;
