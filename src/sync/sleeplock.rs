use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use super::spinlock::SpinLock;
use crate::scheduler::{self, Channel};

struct SleepState {
    locked: bool,
    /// Kernel thread holding the lock. A process keeps its host thread for
    /// its whole life, so the thread id names the holder across cores.
    holder: Option<ThreadId>,
}

/// Long-term lock: waiters give up the core instead of spinning.
pub struct SleepLock<T: ?Sized> {
    name: &'static str,
    lk: SpinLock<SleepState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        SleepLock {
            name,
            lk: SpinLock::new("sleep lock", SleepState { locked: false, holder: None }),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    fn channel(&self) -> Channel {
        Channel::Lock(self as *const Self as *const () as usize)
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut state = self.lk.lock();
        while state.locked {
            state = scheduler::sleep(self.channel(), state);
        }
        state.locked = true;
        state.holder = Some(thread::current().id());
        drop(state);
        SleepLockGuard { lock: self }
    }

    /// Does the calling kernel thread hold this lock?
    pub fn holding(&self) -> bool {
        let state = self.lk.lock();
        state.locked && state.holder == Some(thread::current().id())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn unlock(&self) {
        let mut state = self.lk.lock();
        state.locked = false;
        state.holder = None;
        scheduler::wakeup(self.channel());
    }
}

pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
}

impl<'a, T: ?Sized> SleepLockGuard<'a, T> {
    pub fn sleeplock(guard: &Self) -> &'a SleepLock<T> {
        guard.lock
    }
}

impl<T: ?Sized> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
