//! File-backed memory-mapped regions.
//!
//! Regions are placed top-down from the process's mmap cursor and filled
//! lazily: nothing is mapped until the first access faults a page in.

use std::sync::Arc;

use bitflags::bitflags;
use x86_64::VirtAddr;

use super::{pg_round_down, pg_round_up, PageTable, PteFlags, PAGE_SIZE};
use crate::error::{KResult, KernelError};
use crate::fs::{File, FileSystem, InodeRef};
use crate::kernel::Kernel;
use crate::scheduler::Process;

bitflags! {
    /// Access a mapping allows.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

pub const MAP_SHARED: u32 = 0x01;
pub const MAP_PRIVATE: u32 = 0x02;

/// Whether stores reach the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    Shared,
    Private,
}

/// One live mapped region.
#[derive(Clone)]
pub struct Vma {
    pub addr: VirtAddr,
    /// Page-rounded length in bytes.
    pub len: u64,
    pub prot: Prot,
    pub sharing: Sharing,
    pub file: Arc<File>,
    /// File offset backing `addr`.
    pub offset: u64,
}

impl Vma {
    pub fn end(&self) -> u64 {
        self.addr.as_u64() + self.len
    }

    pub fn contains(&self, va: u64) -> bool {
        va >= self.addr.as_u64() && va < self.end()
    }

    /// Leaf flags for pages of this region.
    pub fn pte_flags(&self) -> PteFlags {
        let mut flags = PteFlags::USER_ACCESSIBLE;
        if self.prot.contains(Prot::WRITE) {
            flags |= PteFlags::WRITABLE;
        }
        if !self.prot.contains(Prot::EXEC) {
            flags |= PteFlags::NO_EXECUTE;
        }
        flags
    }

    fn inode(&self) -> KResult<&InodeRef> {
        self.file.inode().ok_or(KernelError::InvalidArgument)
    }
}

impl Kernel {
    /// Map `length` bytes of the file open at `fd` into the current process.
    /// Returns the address chosen for the region.
    pub fn mmap(&self, length: u64, prot: u32, flags: u32, fd: usize) -> KResult<VirtAddr> {
        if length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let len = length
            .checked_add(PAGE_SIZE - 1)
            .map(pg_round_down)
            .ok_or(KernelError::InvalidArgument)?;
        let prot = Prot::from_bits(prot).ok_or(KernelError::InvalidArgument)?;
        if prot.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        let sharing = match flags {
            MAP_SHARED => Sharing::Shared,
            MAP_PRIVATE => Sharing::Private,
            _ => return Err(KernelError::InvalidArgument),
        };

        let file = self.fd_get(fd)?;
        let inode = file.inode().ok_or(KernelError::InvalidArgument)?;
        if sharing == Sharing::Shared && prot.contains(Prot::WRITE) && !file.writable {
            return Err(KernelError::PermissionDenied);
        }
        if prot.contains(Prot::READ) && !file.readable {
            return Err(KernelError::PermissionDenied);
        }
        // A read-only view cannot run past the end of the file.
        if prot.contains(Prot::READ) && !prot.contains(Prot::WRITE) && length > pg_round_up(inode.size()) {
            return Err(KernelError::InvalidArgument);
        }

        let data = unsafe { self.current().data_mut() };
        let slot = data.vmas.iter().position(Option::is_none).ok_or(KernelError::NoFreeMapping)?;

        let addr = data.mmap_end.checked_sub(len).ok_or(KernelError::OutOfMemory)?;
        if addr < pg_round_up(data.sz) {
            return Err(KernelError::OutOfMemory);
        }
        data.mmap_end = addr;
        data.vmas[slot] = Some(Vma { addr: VirtAddr::new(addr), len, prot, sharing, file, offset: 0 });
        log::debug!("mmap: fd {} at {:#x} ({} bytes, {:?})", fd, addr, len, sharing);
        Ok(VirtAddr::new(addr))
    }

    /// Fault in the page holding `va` from the region that covers it.
    pub(crate) fn mmap_fault(&self, p: &Process, va: u64) -> KResult<()> {
        let data = unsafe { p.data_mut() };
        let vma = data
            .vmas
            .iter()
            .flatten()
            .find(|vma| vma.contains(va))
            .ok_or(KernelError::UnhandledFault)?;
        let pt = data.pagetable.as_mut().ok_or(KernelError::UnhandledFault)?;
        let inode = vma.inode().map_err(|_| KernelError::UnhandledFault)?;

        let page = pg_round_down(va);
        let pa = self.kmem.allocate_zeroed().ok_or(KernelError::UnhandledFault)?;

        // Reading short at the tail of the file leaves the rest zero.
        {
            let _guard = inode.lock();
            let dst = unsafe { self.kmem.memory().page_mut(pa) };
            inode.read_at(vma.offset + (page - vma.addr.as_u64()), dst);
        }

        if let Err(e) = pt.map_pages(VirtAddr::new(page), PAGE_SIZE, pa, vma.pte_flags()) {
            log::warn!("mmap fault at {:#x}: {}", va, e);
            self.kmem.free(pa);
            return Err(KernelError::UnhandledFault);
        }
        Ok(())
    }

    /// Remove `[addr, addr + len)` from a region of the current process.
    /// Only the head or the tail of a region may go.
    pub fn munmap(&self, addr: VirtAddr, len: u64) -> KResult<()> {
        if !addr.is_aligned(PAGE_SIZE) || len == 0 || len % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let start = addr.as_u64();
        let end = start.checked_add(len).ok_or(KernelError::InvalidArgument)?;

        let data = unsafe { self.current().data_mut() };
        let slot = data
            .vmas
            .iter()
            .position(|v| v.as_ref().is_some_and(|v| v.contains(start)))
            .ok_or(KernelError::InvalidArgument)?;
        let Some(vma) = data.vmas[slot].as_mut() else {
            return Err(KernelError::InvalidArgument);
        };
        let before = vma.clone();
        let inode = before.inode()?.clone();

        let whole = if start == vma.addr.as_u64() {
            if end > vma.end() {
                return Err(KernelError::InvalidArgument);
            }
            if end == vma.end() {
                true
            } else {
                vma.addr = VirtAddr::new(end);
                vma.len -= len;
                vma.offset += len;
                false
            }
        } else {
            if end < before.end() {
                return Err(KernelError::UnsupportedSplit);
            }
            if end > before.end() {
                return Err(KernelError::InvalidArgument);
            }
            vma.len -= len;
            false
        };

        let pt = data.pagetable.as_mut().ok_or(KernelError::BadAddress)?;
        if before.sharing == Sharing::Shared {
            let offset = before.offset + (start - before.addr.as_u64());
            if let Err(e) = self.write_back(pt, &inode, start, end, offset) {
                log::warn!("munmap: writeback of {:#x}..{:#x} failed: {}", start, end, e);
                data.vmas[slot] = Some(before);
                return Err(e);
            }
        }

        unmap_present(self, pt, start, end);
        if whole {
            data.vmas[slot] = None;
        }
        Ok(())
    }

    /// Write back and drop every region of `p`, on the way out of exit.
    pub(crate) fn unmap_all(&self, p: &Process) {
        let data = unsafe { p.data_mut() };
        let Some(pt) = data.pagetable.as_mut() else {
            return;
        };
        for slot in data.vmas.iter_mut() {
            let Some(vma) = slot.take() else {
                continue;
            };
            if vma.sharing == Sharing::Shared {
                if let Ok(inode) = vma.inode() {
                    if let Err(e) = self.write_back(pt, inode, vma.addr.as_u64(), vma.end(), vma.offset) {
                        log::warn!("exit: writeback of {:#x} failed: {}", vma.addr.as_u64(), e);
                    }
                }
            }
            unmap_present(self, pt, vma.addr.as_u64(), vma.end());
        }
    }

    /// Store every present, dirty page of `[start, end)` to `inode`,
    /// starting at file offset `offset`, inside one transaction.
    fn write_back(&self, pt: &PageTable, inode: &InodeRef, start: u64, end: u64, offset: u64) -> KResult<()> {
        let fs = self.fs();
        fs.begin_op();
        let result = {
            let _guard = inode.lock();
            (start..end).step_by(PAGE_SIZE as usize).try_for_each(|a| {
                let Some(pte) = pt.walk(VirtAddr::new(a)) else {
                    return Ok(());
                };
                if !pte.flags.contains(PteFlags::PRESENT | PteFlags::DIRTY) {
                    return Ok(());
                }
                let page = unsafe { self.kmem.memory().page(pte.addr) };
                if inode.write_at(offset + (a - start), page) < page.len() {
                    return Err(KernelError::IoError);
                }
                Ok(())
            })
        };
        fs.end_op();
        result
    }
}

/// Unmap the pages of `[start, end)` that were faulted in.
fn unmap_present(kernel: &Kernel, pt: &mut PageTable, start: u64, end: u64) {
    for a in (start..end).step_by(PAGE_SIZE as usize) {
        let va = VirtAddr::new(a);
        if pt.walk(va).is_some() {
            pt.unmap_pages(&kernel.kmem, va, 1);
        }
    }
}
