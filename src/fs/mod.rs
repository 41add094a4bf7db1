pub mod bio;
pub mod file;
pub mod ramfs;

use std::sync::Arc;

use crate::error::KResult;
use crate::sync::SleepLockGuard;

pub use bio::{BufGuard, BufId, BufferCache};
pub use file::{File, FileType};
pub use ramfs::RamFs;

/// Shared handle on an in-memory inode. Cloning is `idup`, dropping is `iput`.
pub type InodeRef = Arc<dyn Inode>;

/// A file-system node as seen by the process and mmap layers.
pub trait Inode: Send + Sync {
    fn inum(&self) -> u32;

    /// Lock the inode's contents. Reads and writes must hold it.
    fn lock(&self) -> SleepLockGuard<'_, ()>;

    /// Current size in bytes.
    fn size(&self) -> u64;

    /// Read up to `dst.len()` bytes starting at `offset`.
    /// Returns the number of bytes read, short at end of file.
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> usize;

    /// Write `src` at `offset`. Returns the number of bytes written, short
    /// when the file cannot grow any further.
    fn write_at(&self, offset: u64, src: &[u8]) -> usize;
}

/// Every concrete file system implements this.
pub trait FileSystem: Send + Sync {
    /// Name of this filesystem (e.g. "ramfs").
    fn name(&self) -> &str;

    /// The root directory.
    fn root(&self) -> InodeRef;

    /// Look up a file by name.
    fn lookup(&self, path: &str) -> KResult<InodeRef>;

    /// Create an empty regular file.
    fn create(&self, path: &str) -> KResult<InodeRef>;

    /// Open a transaction. Every inode mutation happens inside one.
    fn begin_op(&self);

    /// Close a transaction; the last one out commits.
    fn end_op(&self);
}
