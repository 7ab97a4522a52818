//! Sleeping mutual exclusion with owner tracking.
//!
//! Unlike a spinlock, a contended `lock` parks the caller on a wait queue.
//! The owner is recorded so misuse is caught: unlocking from another
//! thread is fatal, and so is re-locking a non-recursive mutex one already
//! holds.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::sync::{SpinLockIrq, WaitQueue};
use crate::task::thread::{self, ThreadId};

#[derive(Debug)]
struct Ownership {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Mutex without protected data: explicit lock/unlock pairs.
pub struct RawMutex {
    state: SpinLockIrq<Ownership>,
    waiters: WaitQueue,
    recursive: bool,
}

impl RawMutex {
    pub const fn new() -> Self {
        Self::with_recursion(false)
    }

    /// A mutex its owner may lock again; each `lock` needs an `unlock`.
    pub const fn new_recursive() -> Self {
        Self::with_recursion(true)
    }

    const fn with_recursion(recursive: bool) -> Self {
        Self {
            state: SpinLockIrq::new(Ownership {
                owner: None,
                depth: 0,
            }),
            waiters: WaitQueue::new(),
            recursive,
        }
    }

    fn acquire(&self, me: ThreadId) -> bool {
        let mut s = self.state.lock();
        match s.owner {
            None => {
                s.owner = Some(me);
                s.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                assert!(self.recursive, "{} locked a non-recursive mutex twice", me);
                s.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    pub fn lock(&self) {
        let me = thread::current().id();
        self.waiters.wait(|| self.acquire(me));
    }

    pub fn try_lock(&self) -> bool {
        let me = thread::current().id();
        self.acquire(me)
    }

    /// Releases one level. At depth 0 the mutex is free and one waiter is
    /// woken.
    pub fn unlock(&self) {
        let me = thread::current().id();
        let released = {
            let mut s = self.state.lock();
            assert_eq!(s.owner, Some(me), "{} unlocked a mutex it does not own", me);
            s.depth -= 1;
            if s.depth == 0 {
                s.owner = None;
            }
            s.depth == 0
        };
        if released {
            self.waiters.wake_one();
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.lock();
        f.debug_struct("RawMutex")
            .field("owner", &s.owner)
            .field("depth", &s.depth)
            .field("recursive", &self.recursive)
            .finish()
    }
}

/// A sleeping, non-recursive mutex protecting a value of type `T`.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// SAFETY: one thread at a time gets `&mut T`.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.raw.try_lock().then(|| MutexGuard { mutex: self })
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").field("raw", &self.raw).finish_non_exhaustive()
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we own the mutex.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we own the mutex.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}
