use std::collections::BTreeMap;

use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame},
    PhysAddr, VirtAddr,
};

pub use x86_64::structures::paging::PageTableFlags as PteFlags;

use super::{pg_round_down, pg_round_up, PageAllocator, PhysMemory, MAXVA, PAGE_SIZE};
use crate::error::{KResult, KernelError};

/// A leaf mapping: the frame a virtual page points at and its permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub addr: PhysAddr,
    pub flags: PteFlags,
}

/// A user address space.
///
/// The hardware radix tree is flattened into an ordered map from page-aligned
/// virtual address to leaf entry; the root frame is still taken from the page
/// allocator so that page-table memory is accounted for. Every mapping holds
/// one reference on its frame, released when the mapping is removed.
pub struct PageTable {
    root: PhysFrame,
    entries: BTreeMap<u64, Pte>,
}

impl PageTable {
    /// Create an empty address space. Returns `None` if out of memory.
    pub fn new(kmem: &PageAllocator) -> Option<Self> {
        let mut allocator = kmem;
        let root = allocator.allocate_frame()?;
        unsafe { kmem.memory().page_mut(root.start_address()).fill(0) };
        Some(PageTable { root, entries: BTreeMap::new() })
    }

    pub fn root(&self) -> PhysAddr {
        self.root.start_address()
    }

    /// Number of leaf mappings.
    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }

    /// Find the leaf entry for `va`, if one is installed.
    pub fn walk(&self, va: VirtAddr) -> Option<&Pte> {
        if va.as_u64() >= MAXVA {
            panic!("walk");
        }
        self.entries.get(&pg_round_down(va.as_u64()))
    }

    pub fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut Pte> {
        if va.as_u64() >= MAXVA {
            panic!("walk");
        }
        self.entries.get_mut(&pg_round_down(va.as_u64()))
    }

    /// Look up a user virtual address and return the physical address of its
    /// page, or `None` if it is not mapped for user access.
    pub fn walk_addr(&self, va: VirtAddr) -> Option<PhysAddr> {
        if va.as_u64() >= MAXVA {
            return None;
        }
        let pte = self.walk(va)?;
        if !pte.flags.contains(PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE) {
            return None;
        }
        Some(pte.addr)
    }

    /// Install mappings for `[va, va + size)` to the frames starting at `pa`.
    /// `va` and `size` must be page-aligned. The caller transfers one frame
    /// reference per page to the table.
    pub fn map_pages(&mut self, va: VirtAddr, size: u64, pa: PhysAddr, flags: PteFlags) -> KResult<()> {
        if !va.is_aligned(PAGE_SIZE) {
            panic!("mappages: va not aligned");
        }
        if size % PAGE_SIZE != 0 {
            panic!("mappages: size not aligned");
        }
        if size == 0 {
            panic!("mappages: size");
        }
        if va.as_u64() + size > MAXVA {
            return Err(KernelError::BadAddress);
        }

        for offset in (0..size).step_by(PAGE_SIZE as usize) {
            let a = va.as_u64() + offset;
            if self.entries.contains_key(&a) {
                panic!("mappages: remap");
            }
            self.entries.insert(a, Pte { addr: pa + offset, flags: flags | PteFlags::PRESENT });
        }
        Ok(())
    }

    /// Map a frame that somebody else also owns, taking a new reference on it.
    pub fn map_shared(&mut self, kmem: &PageAllocator, va: VirtAddr, pa: PhysAddr, flags: PteFlags) -> KResult<()> {
        kmem.increment(pa);
        self.map_pages(va, PAGE_SIZE, pa, flags).inspect_err(|_| kmem.free(pa))
    }

    /// Remove `npages` of mappings starting at `va`, dropping each mapping's
    /// frame reference. The mappings must exist.
    pub fn unmap_pages(&mut self, kmem: &PageAllocator, va: VirtAddr, npages: u64) {
        if !va.is_aligned(PAGE_SIZE) {
            panic!("uvmunmap: not aligned");
        }
        for i in 0..npages {
            let a = va.as_u64() + i * PAGE_SIZE;
            match self.entries.remove(&a) {
                Some(pte) => kmem.free(pte.addr),
                None => panic!("uvmunmap: not mapped"),
            }
        }
    }

    /// Grow user memory from `oldsz` to `newsz` with zeroed pages.
    /// Returns the new size.
    pub fn uvm_alloc(&mut self, kmem: &PageAllocator, oldsz: u64, newsz: u64, xperm: PteFlags) -> KResult<u64> {
        if newsz < oldsz {
            return Ok(oldsz);
        }

        let start = pg_round_up(oldsz);
        for a in (start..newsz).step_by(PAGE_SIZE as usize) {
            let Some(pa) = kmem.allocate_zeroed() else {
                self.uvm_dealloc(kmem, a, start);
                return Err(KernelError::OutOfMemory);
            };
            let flags = PteFlags::USER_ACCESSIBLE | xperm;
            if let Err(e) = self.map_pages(VirtAddr::new(a), PAGE_SIZE, pa, flags) {
                kmem.free(pa);
                self.uvm_dealloc(kmem, a, start);
                return Err(e);
            }
        }
        Ok(newsz)
    }

    /// Shrink user memory from `oldsz` to `newsz`. Returns the new size.
    pub fn uvm_dealloc(&mut self, kmem: &PageAllocator, oldsz: u64, newsz: u64) -> u64 {
        if newsz >= oldsz {
            return oldsz;
        }

        if pg_round_up(newsz) < pg_round_up(oldsz) {
            let npages = (pg_round_up(oldsz) - pg_round_up(newsz)) / PAGE_SIZE;
            self.unmap_pages(kmem, VirtAddr::new(pg_round_up(newsz)), npages);
        }
        newsz
    }

    /// Copy the user pages of `[start, end)` into `child`, frame by frame.
    /// With `sparse`, pages that were never faulted in are skipped; otherwise
    /// every page must be present. On failure the pages already copied by this
    /// call are unmapped from `child`.
    pub fn uvm_copy(&self, child: &mut PageTable, kmem: &PageAllocator, start: u64, end: u64, sparse: bool) -> KResult<()> {
        let mem = kmem.memory();
        let mut copied = Vec::new();

        for a in (pg_round_down(start)..end).step_by(PAGE_SIZE as usize) {
            let pte = match self.entries.get(&a) {
                Some(pte) => *pte,
                None if sparse => continue,
                None => panic!("uvmcopy: page not present"),
            };
            let result = match kmem.allocate() {
                Some(pa) => {
                    unsafe { mem.page_mut(pa).copy_from_slice(mem.page(pte.addr)) };
                    child
                        .map_pages(VirtAddr::new(a), PAGE_SIZE, pa, pte.flags)
                        .inspect_err(|_| kmem.free(pa))
                }
                None => Err(KernelError::OutOfMemory),
            };
            if let Err(e) = result {
                for va in copied {
                    child.unmap_pages(kmem, VirtAddr::new(va), 1);
                }
                return Err(e);
            }
            copied.push(a);
        }
        Ok(())
    }

    /// Copy from kernel to user.
    pub fn copy_out(&mut self, mem: &PhysMemory, dstva: VirtAddr, src: &[u8]) -> KResult<()> {
        let mut va = dstva.as_u64();
        let mut done = 0;
        while done < src.len() {
            let page = pg_round_down(va);
            let pte = match VirtAddr::try_new(page).ok().filter(|v| v.as_u64() < MAXVA) {
                Some(v) => self.walk(v).copied(),
                None => None,
            };
            let pa = match pte {
                Some(pte) if pte.flags.contains(PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE | PteFlags::WRITABLE) => {
                    pte.addr
                }
                _ => return Err(KernelError::BadAddress),
            };
            let offset = (va - page) as usize;
            let n = (PAGE_SIZE as usize - offset).min(src.len() - done);
            unsafe { mem.page_mut(pa)[offset..offset + n].copy_from_slice(&src[done..done + n]) };
            done += n;
            va = page + PAGE_SIZE;
        }
        Ok(())
    }

    /// Copy from user to kernel.
    pub fn copy_in(&self, mem: &PhysMemory, dst: &mut [u8], srcva: VirtAddr) -> KResult<()> {
        let mut va = srcva.as_u64();
        let mut done = 0;
        while done < dst.len() {
            let page = pg_round_down(va);
            let pa = VirtAddr::try_new(page)
                .ok()
                .and_then(|v| self.walk_addr(v))
                .ok_or(KernelError::BadAddress)?;
            let offset = (va - page) as usize;
            let n = (PAGE_SIZE as usize - offset).min(dst.len() - done);
            dst[done..done + n].copy_from_slice(unsafe { &mem.page(pa)[offset..offset + n] });
            done += n;
            va = page + PAGE_SIZE;
        }
        Ok(())
    }

    /// Tear down the address space: drop every mapping's frame reference,
    /// then free the root.
    pub fn free(mut self, kmem: &PageAllocator) {
        for (_, pte) in core::mem::take(&mut self.entries) {
            kmem.free(pte.addr);
        }
        let mut allocator = kmem;
        unsafe { allocator.deallocate_frame(self.root) };
    }
}
