use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::interrupts::{pop_off, push_off};
use crate::scheduler::cpu::cpu_uid;

/// Mutual-exclusion lock that never sleeps.
///
/// Acquiring disables interrupts on the current core until the matching
/// release, and records which core holds the lock so that re-acquiring or
/// releasing from the wrong core is caught.
pub struct SpinLock<T: ?Sized> {
    name: &'static str,
    locked: spin::Mutex<()>,
    /// `uid` of the holding core, 0 when free.
    owner: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        SpinLock {
            name,
            locked: spin::Mutex::new(()),
            owner: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        // disable interrupts to avoid deadlock.
        push_off();
        if self.holding() {
            panic!("acquire {}: already held", self.name);
        }
        core::mem::forget(self.locked.lock());
        self.owner.store(cpu_uid(), Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// Is this core holding the lock?
    /// Must be called with interrupts off.
    pub fn holding(&self) -> bool {
        self.locked.is_locked() && self.owner.load(Ordering::Relaxed) == cpu_uid()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Release a lock whose guard was forgotten.
    ///
    /// # Safety
    /// The caller must hold the lock and no live guard may refer to it.
    pub unsafe fn force_unlock(&self) {
        if !self.holding() {
            panic!("release {}", self.name);
        }
        self.owner.store(0, Ordering::Relaxed);
        self.locked.force_unlock();
        pop_off();
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// The lock this guard holds.
    pub fn spinlock(guard: &Self) -> &'a SpinLock<T> {
        guard.lock
    }

    /// Release the lock, returning it so it can be re-acquired later.
    pub fn unlock(guard: Self) -> &'a SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        unsafe { self.lock.force_unlock() }
    }
}
