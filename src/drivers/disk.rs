use std::sync::atomic::{AtomicUsize, Ordering};

use crate::param::BSIZE;
use crate::sync::SpinLock;

// ──────────────────────────────────────────────────────────────
//  Geometry
// ──────────────────────────────────────────────────────────────

pub const SECTOR_SIZE: usize = 512;
const SECTORS_PER_BLOCK: usize = BSIZE / SECTOR_SIZE;

/// Block device used by the buffer cache.
///
/// Transfers are synchronous and always succeed; an out-of-range request is a
/// kernel bug and panics.
pub trait Disk: Send + Sync {
    /// Read (`write == false`) or write one block of device `dev`.
    fn rw(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE], write: bool);
}

// ──────────────────────────────────────────────────────────────
//  RAM disk
// ──────────────────────────────────────────────────────────────

/// Memory-backed disk addressed in 512-byte sectors.
pub struct RamDisk {
    dev: u32,
    sectors: SpinLock<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(dev: u32, blocks: u32) -> Self {
        RamDisk {
            dev,
            sectors: SpinLock::new("disk", vec![[0; SECTOR_SIZE]; blocks as usize * SECTORS_PER_BLOCK]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn blocks(&self) -> u32 {
        (self.sectors.lock().len() / SECTORS_PER_BLOCK) as u32
    }

    /// Block reads performed so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Block writes performed so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Read one 512-byte sector at the given LBA.
    pub fn read_sector(&self, lba: usize, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock();
        match sectors.get(lba) {
            Some(sector) => buf.copy_from_slice(sector),
            None => panic!("ramdisk: sector {} out of range", lba),
        }
    }

    /// Write one 512-byte sector at the given LBA.
    pub fn write_sector(&self, lba: usize, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock();
        match sectors.get_mut(lba) {
            Some(sector) => sector.copy_from_slice(buf),
            None => panic!("ramdisk: sector {} out of range", lba),
        }
    }
}

impl Disk for RamDisk {
    fn rw(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE], write: bool) {
        if dev != self.dev {
            panic!("ramdisk: no device {}", dev);
        }
        let lba = blockno as usize * SECTORS_PER_BLOCK;
        for (i, chunk) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let sector: &mut [u8; SECTOR_SIZE] = chunk.try_into().unwrap_or_else(|_| unreachable!());
            if write {
                self.write_sector(lba + i, sector);
            } else {
                self.read_sector(lba + i, sector);
            }
        }
        if write {
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
    }
}
