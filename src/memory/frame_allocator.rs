use std::sync::Arc;

use x86_64::{
    structures::paging::{FrameAllocator, FrameDeallocator, PhysFrame, Size4KiB},
    PhysAddr,
};

use super::{PhysMemory, PAGE_SIZE};
use crate::sync::SpinLock;

/// Fill pattern of a freshly allocated frame.
pub const ALLOC_JUNK: u8 = 5;
/// Fill pattern of a free frame.
pub const FREE_JUNK: u8 = 1;

/// Index-based free list over the frame arena.
struct FreeList {
    head: Option<usize>,
    next: Box<[Option<usize>]>,
    len: usize,
}

impl FreeList {
    fn push(&mut self, index: usize) {
        self.next[index] = self.head;
        self.head = Some(index);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<usize> {
        let index = self.head?;
        self.head = self.next[index].take();
        self.len -= 1;
        Some(index)
    }
}

/// Physical page allocator: one global free list plus a reference count per
/// frame, so a frame can have several owners.
pub struct PageAllocator {
    memory: Arc<PhysMemory>,
    freelist: SpinLock<FreeList>,
    refs: SpinLock<Box<[u32]>>,
}

impl PageAllocator {
    /// Take ownership of every frame in `memory`.
    pub fn new(memory: Arc<PhysMemory>) -> Self {
        let pages = memory.page_count();
        let mut list = FreeList {
            head: None,
            next: vec![None; pages].into_boxed_slice(),
            len: 0,
        };
        // Push in reverse so allocation hands out ascending addresses.
        for index in (0..pages).rev() {
            unsafe { memory.page_mut(memory.frame_addr(index)).fill(FREE_JUNK) };
            list.push(index);
        }
        PageAllocator {
            memory,
            freelist: SpinLock::new("kmem", list),
            refs: SpinLock::new("kmem refs", vec![0; pages].into_boxed_slice()),
        }
    }

    pub fn memory(&self) -> &Arc<PhysMemory> {
        &self.memory
    }

    /// Allocate one frame, filled with junk. Its reference count starts at 1.
    /// Returns `None` when memory is exhausted.
    pub fn allocate(&self) -> Option<PhysAddr> {
        let index = self.freelist.lock().pop()?;
        let pa = self.memory.frame_addr(index);
        {
            let mut refs = self.refs.lock();
            if refs[index] != 0 {
                panic!("kalloc: free frame {:#x} has {} owners", pa.as_u64(), refs[index]);
            }
            refs[index] = 1;
        }
        unsafe { self.memory.page_mut(pa).fill(ALLOC_JUNK) };
        Some(pa)
    }

    /// Allocate one frame and zero it.
    pub fn allocate_zeroed(&self) -> Option<PhysAddr> {
        let pa = self.allocate()?;
        unsafe { self.memory.page_mut(pa).fill(0) };
        Some(pa)
    }

    /// Add an owner to an allocated frame.
    pub fn increment(&self, pa: PhysAddr) {
        let index = self.check(pa, "increment");
        let mut refs = self.refs.lock();
        if refs[index] == 0 {
            panic!("increment: frame {:#x} is free", pa.as_u64());
        }
        refs[index] += 1;
    }

    /// Drop one owner of `pa`. The last owner returns it to the free list.
    pub fn free(&self, pa: PhysAddr) {
        let index = self.check(pa, "kfree");
        let last = {
            let mut refs = self.refs.lock();
            match refs[index] {
                0 => panic!("kfree: frame {:#x} freed twice", pa.as_u64()),
                n => {
                    refs[index] = n - 1;
                    n == 1
                }
            }
        };
        if last {
            // Fill with junk to catch dangling refs.
            unsafe { self.memory.page_mut(pa).fill(FREE_JUNK) };
            self.freelist.lock().push(index);
        }
    }

    pub fn refcount(&self, pa: PhysAddr) -> u32 {
        let index = self.check(pa, "refcount");
        self.refs.lock()[index]
    }

    pub fn free_frames(&self) -> usize {
        self.freelist.lock().len
    }

    fn check(&self, pa: PhysAddr, what: &str) -> usize {
        if !pa.is_aligned(PAGE_SIZE) || !self.memory.contains(pa) {
            panic!("{}: bad frame {:#x}", what, pa.as_u64());
        }
        self.memory.frame_index(pa)
    }
}

unsafe impl FrameAllocator<Size4KiB> for &PageAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocate().map(PhysFrame::containing_address)
    }
}

impl FrameDeallocator<Size4KiB> for &PageAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) {
        self.free(frame.start_address());
    }
}
