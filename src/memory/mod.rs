pub mod frame_allocator;
pub mod mmap;
pub mod paging;

use core::cell::UnsafeCell;

use x86_64::PhysAddr;

pub use frame_allocator::PageAllocator;
pub use paging::{PageTable, PteFlags};

pub const PAGE_SIZE: u64 = 4096;

/// Physical address where managed RAM starts.
pub const KERNBASE: u64 = 0x8000_0000;

/// One past the highest user virtual address.
pub const MAXVA: u64 = 1 << 38;
/// Kernel trap entry page, mapped at the top of every address space.
pub const TRAMPOLINE: u64 = MAXVA - PAGE_SIZE;
/// Per-process saved user registers, just below the trampoline.
pub const TRAPFRAME: u64 = TRAMPOLINE - PAGE_SIZE;
/// Initial mmap cursor: regions grow down from here, one guard page below
/// the trapframe.
pub const MMAP_END: u64 = TRAPFRAME - PAGE_SIZE;

pub const fn pg_round_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub const fn pg_round_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; PAGE_SIZE as usize]>);

/// Simulated physical RAM: a contiguous run of page frames starting at `base`.
///
/// Frames are handed out by the page allocator; whoever owns a frame may
/// access it through `page`/`page_mut`.
pub struct PhysMemory {
    base: PhysAddr,
    frames: Box<[Frame]>,
}

unsafe impl Sync for PhysMemory {}

impl PhysMemory {
    pub fn new(base: PhysAddr, pages: usize) -> Self {
        assert!(base.is_aligned(PAGE_SIZE), "PhysMemory: unaligned base");
        let frames = (0..pages)
            .map(|_| Frame(UnsafeCell::new([0; PAGE_SIZE as usize])))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        PhysMemory { base, frames }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// One past the last managed byte.
    pub fn end(&self) -> PhysAddr {
        self.base + self.frames.len() as u64 * PAGE_SIZE
    }

    pub fn page_count(&self) -> usize {
        self.frames.len()
    }

    pub fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.base && pa < self.end()
    }

    pub fn frame_index(&self, pa: PhysAddr) -> usize {
        assert!(self.contains(pa), "frame_index: {:#x} outside RAM", pa.as_u64());
        ((pa - self.base) / PAGE_SIZE) as usize
    }

    pub fn frame_addr(&self, index: usize) -> PhysAddr {
        self.base + index as u64 * PAGE_SIZE
    }

    /// # Safety
    /// No one may be writing the frame concurrently.
    pub unsafe fn page(&self, pa: PhysAddr) -> &[u8; PAGE_SIZE as usize] {
        &*self.frames[self.frame_index(pa.align_down(PAGE_SIZE))].0.get()
    }

    /// # Safety
    /// The caller must own the frame and hold no other reference into it.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_mut(&self, pa: PhysAddr) -> &mut [u8; PAGE_SIZE as usize] {
        &mut *self.frames[self.frame_index(pa.align_down(PAGE_SIZE))].0.get()
    }

    /// View the start of a frame as a `T`.
    ///
    /// # Safety
    /// As for `page_mut`; `T` must fit in a page and accept any bit pattern.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<T>(&self, pa: PhysAddr) -> &mut T {
        debug_assert!(core::mem::size_of::<T>() <= PAGE_SIZE as usize);
        &mut *(self.page_mut(pa).as_mut_ptr() as *mut T)
    }
}
