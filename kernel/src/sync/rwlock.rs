//! Reader-writer lock with fairness in both directions.
//!
//! State, all under one spinlock:
//!
//! | field              | meaning                                            |
//! |--------------------|----------------------------------------------------|
//! | `active`           | > 0 readers inside, -1 a writer inside, 0 free     |
//! | `pending_readers`  | readers in `rlock` that have not entered yet       |
//! | `pending_writers`  | writers in `wlock` that have not entered yet       |
//! | `admitted_readers` | pending readers past the writer gate               |
//! | `write_generation` | number of write sections ended so far              |
//!
//! Writers cannot starve: a reader arriving while a writer is pending
//! waits at a gate until a write section that began after its arrival has
//! ended. Readers cannot starve: a writer only enters when no admitted
//! reader is waiting, so the readers released by a write unlock go in as
//! a batch before the next writer.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem;
use core::ops::{Deref, DerefMut};

use bitflags::bitflags;

use crate::sync::{SpinLockIrq, WaitQueue};
use crate::task::thread::{self, ThreadId};

bitflags! {
    /// Construction options of a [`RawRwLock`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RwLockFlags: u32 {
        /// Let the write owner lock again. Not supported: rejected by
        /// [`RawRwLock::with_flags`].
        const RECURSIVE = 1 << 0;
    }
}

#[derive(Debug)]
struct RwState {
    active: isize,
    pending_readers: usize,
    pending_writers: usize,
    admitted_readers: usize,
    write_generation: u64,
    owner: Option<ThreadId>,
}

/// The lock without protected data: explicit lock/unlock pairs.
pub struct RawRwLock {
    state: SpinLockIrq<RwState>,
    shared: WaitQueue,
    exclusive: WaitQueue,
}

impl RawRwLock {
    pub const fn new() -> Self {
        Self {
            state: SpinLockIrq::new(RwState {
                active: 0,
                pending_readers: 0,
                pending_writers: 0,
                admitted_readers: 0,
                write_generation: 0,
                owner: None,
            }),
            shared: WaitQueue::new(),
            exclusive: WaitQueue::new(),
        }
    }

    /// Creates a lock with the given options. Panics on
    /// [`RwLockFlags::RECURSIVE`].
    pub fn with_flags(flags: RwLockFlags) -> Self {
        assert!(
            !flags.contains(RwLockFlags::RECURSIVE),
            "recursive rwlocks are not supported"
        );
        Self::new()
    }

    /// Enters as a reader, blocking while a writer is inside or ahead.
    pub fn rlock(&self) {
        let gate = {
            let mut s = self.state.lock();
            s.pending_readers += 1;
            if s.pending_writers > 0 {
                // A write section running right now began before us; the
                // one we queue behind is the next one.
                let ahead = if s.active < 0 { 2 } else { 1 };
                Some(s.write_generation + ahead)
            } else {
                s.admitted_readers += 1;
                None
            }
        };

        if let Some(target) = gate {
            self.shared.wait(|| {
                let mut s = self.state.lock();
                if s.write_generation >= target {
                    s.admitted_readers += 1;
                    true
                } else {
                    false
                }
            });
        }

        self.shared.wait(|| {
            let mut s = self.state.lock();
            if s.active >= 0 {
                s.active += 1;
                s.admitted_readers -= 1;
                s.pending_readers -= 1;
                true
            } else {
                false
            }
        });
    }

    /// Enters as a reader only if that needs no waiting and no writer is
    /// pending.
    pub fn try_rlock(&self) -> bool {
        let mut s = self.state.lock();
        if s.active >= 0 && s.pending_writers == 0 {
            s.active += 1;
            true
        } else {
            false
        }
    }

    /// Leaves as a reader. The last reader out lets a pending writer in.
    pub fn runlock(&self) {
        let wake_writer = {
            let mut s = self.state.lock();
            assert!(s.active > 0, "runlock without an active reader");
            s.active -= 1;
            s.active == 0 && s.pending_writers > 0
        };
        if wake_writer {
            self.exclusive.wake_one();
        }
    }

    /// Enters as the writer. Locking again from the owner is fatal.
    pub fn wlock(&self) {
        let me = thread::current().id();
        {
            let mut s = self.state.lock();
            assert!(s.owner != Some(me), "recursive write lock by {}", me);
            s.pending_writers += 1;
        }
        self.exclusive.wait(|| {
            let mut s = self.state.lock();
            if s.active == 0 && s.admitted_readers == 0 {
                s.active = -1;
                s.pending_writers -= 1;
                s.owner = Some(me);
                true
            } else {
                false
            }
        });
    }

    /// Enters as the writer only if the lock is free and no admitted
    /// reader is waiting.
    pub fn try_wlock(&self) -> bool {
        let me = thread::current_id();
        let mut s = self.state.lock();
        assert!(
            me.is_none() || s.owner != me,
            "recursive write lock by the owner"
        );
        if s.active == 0 && s.admitted_readers == 0 {
            s.active = -1;
            s.owner = me;
            true
        } else {
            false
        }
    }

    /// Leaves as the writer. Pending readers are released as a batch.
    pub fn wunlock(&self) {
        let (readers, writers) = {
            let mut s = self.state.lock();
            assert_eq!(s.active, -1, "wunlock without an active writer");
            s.active = 0;
            s.owner = None;
            s.write_generation += 1;
            (s.pending_readers > 0, s.pending_writers > 0)
        };
        if readers {
            self.shared.wake_all();
        }
        // Gated readers may not be able to enter yet; the writer re-checks
        // and goes back to sleep if admitted readers are ahead of it.
        if writers {
            self.exclusive.wake_one();
        }
    }

    /// Turns the write lock into a read lock without letting another
    /// writer in between. Pending readers may join.
    pub fn downgrade(&self) {
        let readers = {
            let mut s = self.state.lock();
            assert_eq!(s.active, -1, "downgrade without an active writer");
            s.active = 1;
            s.owner = None;
            s.write_generation += 1;
            s.pending_readers > 0
        };
        if readers {
            self.shared.wake_all();
        }
    }

    /// `(pending readers, pending writers)`. Only a snapshot.
    pub fn pending(&self) -> (usize, usize) {
        let s = self.state.lock();
        (s.pending_readers, s.pending_writers)
    }

    /// Readers inside. Only a snapshot.
    pub fn readers(&self) -> usize {
        usize::try_from(self.state.lock().active).unwrap_or(0)
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().active < 0
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawRwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.lock();
        f.debug_struct("RawRwLock")
            .field("active", &s.active)
            .field("pending_readers", &s.pending_readers)
            .field("pending_writers", &s.pending_writers)
            .field("owner", &s.owner)
            .finish()
    }
}

// ── Data-carrying lock ──────────────────────────────────────────

/// A [`RawRwLock`] protecting a value of type `T`.
pub struct RwLock<T: ?Sized> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

// SAFETY: readers share `&T` across threads, the writer gets `&mut T`.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.raw.rlock();
        RwLockReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        self.raw.try_rlock().then(|| RwLockReadGuard { lock: self })
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.raw.wlock();
        RwLockWriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.raw.try_wlock().then(|| RwLockWriteGuard { lock: self })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// The underlying lock, for its counters.
    pub fn raw(&self) -> &RawRwLock {
        &self.raw
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock").field("raw", &self.raw).finish_non_exhaustive()
    }
}

pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we are a reader; no writer is inside.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.runlock();
    }
}

pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<'a, T: ?Sized> RwLockWriteGuard<'a, T> {
    /// Keeps read access, lets the other readers in.
    pub fn downgrade(self) -> RwLockReadGuard<'a, T> {
        let lock = self.lock;
        mem::forget(self);
        lock.raw.downgrade();
        RwLockReadGuard { lock }
    }
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we are the writer.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we are the writer.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.wunlock();
    }
}
