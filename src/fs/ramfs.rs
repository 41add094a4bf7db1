use std::sync::Arc;

use super::bio::BufferCache;
use super::{FileSystem, Inode, InodeRef};
use crate::error::{KResult, KernelError};
use crate::param::BSIZE;
use crate::scheduler::{self, Channel};
use crate::sync::{SleepLock, SleepLockGuard, SpinLock};

/// Blocks given to a file created through `FileSystem::create`.
pub const DEFAULT_FILE_BLOCKS: u32 = 16;
/// Transactions allowed to be open at once.
const MAX_OUTSTANDING: usize = 3;
/// First data block; block 0 is left for a boot sector.
const FIRST_DATA_BLOCK: u32 = 1;

// ──────────────────────────────────────────────────────────────
//  Inodes
// ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
}

/// A file stored as one contiguous extent of disk blocks, read and written
/// through the buffer cache.
pub struct RamInode {
    inum: u32,
    dev: u32,
    node_type: NodeType,
    start: u32,
    nblocks: u32,
    size: SpinLock<u64>,
    lock: SleepLock<()>,
    bcache: Arc<BufferCache>,
}

impl RamInode {
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Largest size the extent can hold.
    pub fn capacity(&self) -> u64 {
        self.nblocks as u64 * BSIZE as u64
    }
}

impl Inode for RamInode {
    fn inum(&self) -> u32 {
        self.inum
    }

    fn lock(&self) -> SleepLockGuard<'_, ()> {
        self.lock.lock()
    }

    fn size(&self) -> u64 {
        *self.size.lock()
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> usize {
        let size = self.size();
        if self.node_type == NodeType::Directory || offset >= size {
            return 0;
        }
        let n = dst.len().min((size - offset) as usize);

        let mut done = 0;
        while done < n {
            let pos = offset as usize + done;
            let b = self.bcache.read(self.dev, self.start + (pos / BSIZE) as u32);
            let within = pos % BSIZE;
            let m = (BSIZE - within).min(n - done);
            dst[done..done + m].copy_from_slice(&b[within..within + m]);
            done += m;
        }
        n
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> usize {
        if self.node_type == NodeType::Directory || offset >= self.capacity() {
            return 0;
        }
        let n = src.len().min((self.capacity() - offset) as usize);

        let mut done = 0;
        while done < n {
            let pos = offset as usize + done;
            let mut b = self.bcache.read(self.dev, self.start + (pos / BSIZE) as u32);
            let within = pos % BSIZE;
            let m = (BSIZE - within).min(n - done);
            b[within..within + m].copy_from_slice(&src[done..done + m]);
            self.bcache.write(&mut b);
            done += m;
        }

        let mut size = self.size.lock();
        *size = (*size).max(offset + n as u64);
        n
    }
}

// ──────────────────────────────────────────────────────────────
//  File system
// ──────────────────────────────────────────────────────────────

struct RamFsInner {
    /// Flat root directory.
    files: Vec<(String, Arc<RamInode>)>,
    next_block: u32,
    next_inum: u32,
}

struct LogState {
    outstanding: usize,
    committed: usize,
}

/// Single-directory file system on a block device.
pub struct RamFs {
    label: &'static str,
    dev: u32,
    limit: u32,
    bcache: Arc<BufferCache>,
    root: Arc<RamInode>,
    inner: SpinLock<RamFsInner>,
    log: SpinLock<LogState>,
}

impl RamFs {
    pub fn new(label: &'static str, dev: u32, blocks: u32, bcache: Arc<BufferCache>) -> Self {
        let root = Arc::new(RamInode {
            inum: 1,
            dev,
            node_type: NodeType::Directory,
            start: FIRST_DATA_BLOCK,
            nblocks: 0,
            size: SpinLock::new("inode size", 0),
            lock: SleepLock::new("inode", ()),
            bcache: bcache.clone(),
        });
        RamFs {
            label,
            dev,
            limit: blocks,
            bcache,
            root,
            inner: SpinLock::new(
                "ramfs",
                RamFsInner { files: Vec::new(), next_block: FIRST_DATA_BLOCK, next_inum: 2 },
            ),
            log: SpinLock::new("log", LogState { outstanding: 0, committed: 0 }),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    /// Create `path` with room for `capacity` bytes.
    pub fn create_with_capacity(&self, path: &str, capacity: u64) -> KResult<Arc<RamInode>> {
        if path.is_empty() || path.contains('/') {
            return Err(KernelError::InvalidArgument);
        }
        let nblocks = (capacity.div_ceil(BSIZE as u64) as u32).max(1);

        let mut inner = self.inner.lock();
        if inner.files.iter().any(|(name, _)| name == path) {
            return Err(KernelError::InvalidArgument);
        }
        if inner.next_block + nblocks > self.limit {
            return Err(KernelError::NoSpace);
        }
        let inode = Arc::new(RamInode {
            inum: inner.next_inum,
            dev: self.dev,
            node_type: NodeType::File,
            start: inner.next_block,
            nblocks,
            size: SpinLock::new("inode size", 0),
            lock: SleepLock::new("inode", ()),
            bcache: self.bcache.clone(),
        });
        inner.next_inum += 1;
        inner.next_block += nblocks;
        inner.files.push((path.to_string(), inode.clone()));
        log::debug!("{}: created {} ({} blocks at {})", self.label, path, nblocks, inode.start);
        Ok(inode)
    }

    /// Create `path` holding `content`.
    pub fn add_file(&self, path: &str, content: &[u8]) -> KResult<InodeRef> {
        let capacity = (content.len() as u64).max(DEFAULT_FILE_BLOCKS as u64 * BSIZE as u64);
        let inode = self.create_with_capacity(path, capacity)?;
        self.begin_op();
        let written = {
            let _guard = inode.lock();
            inode.write_at(0, content)
        };
        self.end_op();
        if written != content.len() {
            return Err(KernelError::IoError);
        }
        Ok(inode)
    }

    /// Transactions currently open.
    pub fn outstanding(&self) -> usize {
        self.log.lock().outstanding
    }

    /// Transactions committed so far.
    pub fn committed(&self) -> usize {
        self.log.lock().committed
    }

    fn log_channel(&self) -> Channel {
        Channel::Addr(&self.log as *const _ as usize)
    }
}

impl FileSystem for RamFs {
    fn name(&self) -> &str {
        self.label
    }

    fn root(&self) -> InodeRef {
        self.root.clone()
    }

    fn lookup(&self, path: &str) -> KResult<InodeRef> {
        let inner = self.inner.lock();
        match inner.files.iter().find(|(name, _)| name == path) {
            Some((_, inode)) => Ok(inode.clone()),
            None => Err(KernelError::InvalidArgument),
        }
    }

    fn create(&self, path: &str) -> KResult<InodeRef> {
        let inode = self.create_with_capacity(path, DEFAULT_FILE_BLOCKS as u64 * BSIZE as u64)?;
        Ok(inode)
    }

    fn begin_op(&self) {
        let mut log = self.log.lock();
        while log.outstanding >= MAX_OUTSTANDING {
            log = scheduler::sleep(self.log_channel(), log);
        }
        log.outstanding += 1;
    }

    fn end_op(&self) {
        let mut log = self.log.lock();
        if log.outstanding == 0 {
            panic!("end_op: no transaction");
        }
        log.outstanding -= 1;
        if log.outstanding == 0 {
            log.committed += 1;
        }
        scheduler::wakeup(self.log_channel());
    }
}
