use log::LevelFilter;

use crate::error::{KResult, KernelError};

/// Number of simulated cores.
pub const NCPU: usize = 3;
/// Size of the process table.
pub const NPROC: usize = 64;
/// Open files per process.
pub const NOFILE: usize = 16;
/// Memory-mapped regions per process.
pub const NMMAP: usize = 16;
/// Buffers in the block cache.
pub const NBUF: usize = 30;
/// Hash buckets in the block cache (prime, to spread consecutive blocks).
pub const NBUCKETS: usize = 13;
/// Disk block size in bytes.
pub const BSIZE: usize = 1024;
/// Device number of the root file system.
pub const ROOTDEV: u32 = 1;
/// Physical frames managed by the page allocator (4 MiB).
pub const PHYS_PAGES: usize = 1024;
/// Blocks on the RAM disk.
pub const DISK_BLOCKS: u32 = 2000;

/// Boot-time configuration of a kernel instance.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub ncpu: usize,
    pub nproc: usize,
    pub nbuf: usize,
    pub nbuckets: usize,
    pub phys_pages: usize,
    pub disk_blocks: u32,
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            ncpu: NCPU,
            nproc: NPROC,
            nbuf: NBUF,
            nbuckets: NBUCKETS,
            phys_pages: PHYS_PAGES,
            disk_blocks: DISK_BLOCKS,
            log_level: LevelFilter::Warn,
        }
    }
}

impl KernelConfig {
    /// Reject configurations the kernel cannot boot with.
    pub fn validate(&self) -> KResult<()> {
        if self.ncpu == 0 || self.nproc == 0 || self.nbuf == 0 || self.nbuckets == 0 {
            return Err(KernelError::InvalidArgument);
        }
        // trampoline, init's trapframe, root table and first user page
        if self.phys_pages < 8 {
            return Err(KernelError::InvalidArgument);
        }
        if self.disk_blocks < 2 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}
