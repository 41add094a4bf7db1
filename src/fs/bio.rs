//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents. Caching disk
//! blocks in memory reduces the number of disk reads and also provides a
//! synchronization point for disk blocks used by multiple processes.
//!
//! Buffers are spread over independently locked hash buckets keyed by
//! `blockno % nbuckets`, so lookups of unrelated blocks do not contend. The
//! global lock is only taken to move an unused buffer from one bucket to
//! another, always before the bucket locks involved.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `read`.
//! * After changing buffer data, call `write` to write it to disk.
//! * Dropping the returned guard releases the buffer.
//! * Only one process at a time can use a buffer, so do not keep them longer
//!   than necessary.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::drivers::Disk;
use crate::param::BSIZE;
use crate::sync::{SleepLock, SleepLockGuard, SpinLock};

/// Chain entry: which block a buffer currently caches and how many borrowers
/// it has. Lives in exactly one bucket.
struct Entry {
    buf: usize,
    /// `(dev, blockno)`, or `None` for a buffer that never held a block.
    key: Option<(u32, u32)>,
    refcnt: u32,
}

struct Bucket {
    chain: Vec<Entry>,
}

impl Bucket {
    fn find(&mut self, dev: u32, blockno: u32) -> Option<&mut Entry> {
        self.chain.iter_mut().find(|e| e.key == Some((dev, blockno)))
    }

    fn position(&self, buf: usize) -> Option<usize> {
        self.chain.iter().position(|e| e.buf == buf)
    }
}

struct Buf {
    /// Has data been read from disk?
    valid: AtomicBool,
    data: SleepLock<[u8; BSIZE]>,
}

/// Identity of a cached buffer, stable while it has borrowers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufId {
    pub index: usize,
    pub dev: u32,
    pub blockno: u32,
}

pub struct BufferCache {
    disk: Arc<dyn Disk>,
    /// Home bucket of every buffer. Changing a home needs this lock.
    lock: SpinLock<Box<[usize]>>,
    buckets: Box<[SpinLock<Bucket>]>,
    bufs: Box<[Buf]>,
}

impl BufferCache {
    pub fn new(disk: Arc<dyn Disk>, nbuf: usize, nbuckets: usize) -> Self {
        let mut chains: Vec<Vec<Entry>> = (0..nbuckets).map(|_| Vec::new()).collect();
        let mut homes = Vec::with_capacity(nbuf);
        for buf in 0..nbuf {
            let home = buf % nbuckets;
            chains[home].push(Entry { buf, key: None, refcnt: 0 });
            homes.push(home);
        }

        BufferCache {
            disk,
            lock: SpinLock::new("bcache", homes.into_boxed_slice()),
            buckets: chains
                .into_iter()
                .map(|chain| SpinLock::new("bcache.bucket", Bucket { chain }))
                .collect(),
            bufs: (0..nbuf)
                .map(|_| Buf { valid: AtomicBool::new(false), data: SleepLock::new("buffer", [0; BSIZE]) })
                .collect(),
        }
    }

    pub fn nbuf(&self) -> usize {
        self.bufs.len()
    }

    fn bucket_of(&self, blockno: u32) -> usize {
        blockno as usize % self.buckets.len()
    }

    /// Look through the cache for block `blockno` on device `dev`. If not
    /// found, recycle an unused buffer. Either way, return it locked.
    pub fn get(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let b = self.bucket_of(blockno);

        // Is the block already cached?
        {
            let mut bucket = self.buckets[b].lock();
            if let Some(entry) = bucket.find(dev, blockno) {
                entry.refcnt += 1;
                let buf = entry.buf;
                drop(bucket);
                return self.lock_buf(buf, dev, blockno);
            }
        }

        // Not cached. Serialize with other relocations and look again: a
        // concurrent caller may have installed the block in the meantime.
        let mut homes = self.lock.lock();
        let mut bucket = self.buckets[b].lock();
        if let Some(entry) = bucket.find(dev, blockno) {
            entry.refcnt += 1;
            let buf = entry.buf;
            drop(bucket);
            drop(homes);
            return self.lock_buf(buf, dev, blockno);
        }

        // Recycle the first unused buffer in the pool.
        for buf in 0..self.bufs.len() {
            let home = homes[buf];
            let entry = if home == b {
                match bucket.position(buf) {
                    Some(pos) if bucket.chain[pos].refcnt == 0 => &mut bucket.chain[pos],
                    _ => continue,
                }
            } else {
                let mut old = self.buckets[home].lock();
                let Some(pos) = old.position(buf) else {
                    panic!("bget: buffer {} missing from bucket {}", buf, home);
                };
                if old.chain[pos].refcnt != 0 {
                    continue;
                }
                let entry = old.chain.swap_remove(pos);
                drop(old);
                bucket.chain.push(entry);
                homes[buf] = b;
                let last = bucket.chain.len() - 1;
                &mut bucket.chain[last]
            };

            entry.key = Some((dev, blockno));
            entry.refcnt = 1;
            self.bufs[buf].valid.store(false, Ordering::Release);
            drop(bucket);
            drop(homes);
            return self.lock_buf(buf, dev, blockno);
        }
        panic!("bget: no buffers");
    }

    fn lock_buf(&self, index: usize, dev: u32, blockno: u32) -> BufGuard<'_> {
        BufGuard {
            cache: self,
            id: BufId { index, dev, blockno },
            data: ManuallyDrop::new(self.bufs[index].data.lock()),
        }
    }

    /// Return a locked buffer with the contents of the indicated block.
    pub fn read(&self, dev: u32, blockno: u32) -> BufGuard<'_> {
        let mut b = self.get(dev, blockno);
        let buf = &self.bufs[b.id.index];
        if !buf.valid.load(Ordering::Acquire) {
            self.disk.rw(dev, blockno, &mut b.data, false);
            buf.valid.store(true, Ordering::Release);
        }
        b
    }

    /// Write the buffer's contents to disk. Must be locked.
    pub fn write(&self, b: &mut BufGuard<'_>) {
        if !self.bufs[b.id.index].data.holding() {
            panic!("bwrite");
        }
        self.disk.rw(b.id.dev, b.id.blockno, &mut b.data, true);
    }

    /// Release a locked buffer.
    fn release(&self, id: BufId) {
        let mut bucket = self.buckets[self.bucket_of(id.blockno)].lock();
        let Some(entry) = bucket.find(id.dev, id.blockno) else {
            panic!("brelse: buffer {} not cached", id.index);
        };
        if entry.refcnt == 0 {
            panic!("brelse: refcnt");
        }
        entry.refcnt -= 1;
    }

    /// Keep a buffer resident without holding its content lock.
    pub fn pin(&self, id: BufId) {
        let mut bucket = self.buckets[self.bucket_of(id.blockno)].lock();
        match bucket.find(id.dev, id.blockno) {
            Some(entry) if entry.buf == id.index => entry.refcnt += 1,
            _ => panic!("bpin: buffer {} not cached", id.index),
        }
    }

    pub fn unpin(&self, id: BufId) {
        let mut bucket = self.buckets[self.bucket_of(id.blockno)].lock();
        match bucket.find(id.dev, id.blockno) {
            Some(entry) if entry.buf == id.index && entry.refcnt > 0 => entry.refcnt -= 1,
            Some(_) => panic!("bunpin: refcnt"),
            None => panic!("bunpin: buffer {} not cached", id.index),
        }
    }

    /// Borrowers of the buffer caching `(dev, blockno)`, if it is cached.
    pub fn refcount(&self, dev: u32, blockno: u32) -> Option<u32> {
        let mut bucket = self.buckets[self.bucket_of(blockno)].lock();
        bucket.find(dev, blockno).map(|e| e.refcnt)
    }

    /// Number of buffers caching `(dev, blockno)`: 0 or 1.
    pub fn cached_copies(&self, dev: u32, blockno: u32) -> usize {
        self.buckets
            .iter()
            .map(|bucket| {
                bucket.lock().chain.iter().filter(|e| e.key == Some((dev, blockno))).count()
            })
            .sum()
    }
}

/// A locked buffer. Dropping it releases the content lock and then the
/// reference.
pub struct BufGuard<'a> {
    cache: &'a BufferCache,
    id: BufId,
    data: ManuallyDrop<SleepLockGuard<'a, [u8; BSIZE]>>,
}

impl BufGuard<'_> {
    pub fn id(&self) -> BufId {
        self.id
    }

    pub fn blockno(&self) -> u32 {
        self.id.blockno
    }
}

impl Deref for BufGuard<'_> {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for BufGuard<'_> {
    fn drop(&mut self) {
        if !SleepLockGuard::sleeplock(&self.data).holding() {
            panic!("brelse");
        }
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.release(self.id);
    }
}
