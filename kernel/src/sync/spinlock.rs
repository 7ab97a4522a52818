// =============================================================================
// ukcore: Spinlocks
// =============================================================================
//
// A spinlock is one word: unlocked or locked. Acquiring it is a
// compare-exchange retry loop; while the word is seen locked the core spins
// on plain loads with a PAUSE hint so the cache line stays shared until the
// holder releases it. Release is a single store with Release ordering, so
// every write made inside the critical section is visible to the next
// holder before it observes the word as unlocked.
//
// TWO FLAVOURS:
//   - plain:    only mutual exclusion between cores.
//   - IRQ-safe: additionally saves and disables the interrupt flag of the
//               current core before acquiring, and restores it after
//               releasing. Any lock that an interrupt handler may also take
//               must be taken this way everywhere, otherwise:
//                 1. Thread A holds lock L with interrupts enabled
//                 2. Interrupt fires on the same core
//                 3. The handler tries to acquire L and spins forever
//
// RULES:
//   - Critical sections are short and never block (no wait queue waits,
//     no yield) while the lock is held.
//   - Never acquire a lock the current core already holds.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use khal::irq::{self, IrqFlags};

// ── Raw lock word ───────────────────────────────────────────────

/// The bare lock word, without protected data.
///
/// Used directly where the protected state is not a single Rust value, and
/// as the building block of [`SpinLock`].
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// Creates an unlocked spinlock.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock, spinning until it is available.
    #[inline]
    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                khal::cpu::relax();
            }
        }
    }

    /// Attempts to acquire the lock once. Returns `true` on success.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    ///
    /// Must only be called by the current holder.
    #[inline]
    pub fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of an unlocked spinlock");
        self.locked.store(false, Ordering::Release);
    }

    /// Whether someone holds the lock right now. Only a snapshot.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Disables interrupts, then acquires the lock.
    #[inline]
    pub fn lock_irqsave(&self) -> IrqFlags {
        let flags = irq::save_and_disable();
        self.lock();
        flags
    }

    /// Disables interrupts and tries the lock once. On failure the
    /// interrupt state is restored before returning `None`.
    #[inline]
    pub fn try_lock_irqsave(&self) -> Option<IrqFlags> {
        let flags = irq::save_and_disable();
        if self.try_lock() {
            Some(flags)
        } else {
            irq::restore(flags);
            None
        }
    }

    /// Releases the lock, then restores the saved interrupt state.
    #[inline]
    pub fn unlock_irqrestore(&self, flags: IrqFlags) {
        self.unlock();
        irq::restore(flags);
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawSpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

// ── Data-carrying lock ──────────────────────────────────────────

/// A spinlock protecting a value of type `T`.
///
/// The data is only reachable through the guards returned by
/// [`lock`](Self::lock) / [`lock_irq`](Self::lock_irq) and their `try_`
/// forms; dropping the guard releases the lock.
///
/// ```ignore
/// static COUNTER: SpinLock<u64> = SpinLock::new(0);
///
/// *COUNTER.lock() += 1;
/// ```
pub struct SpinLock<T: ?Sized> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: the lock hands out access to `T` to one core at a time, so the
// value effectively moves between cores; `T: Send` is all that requires.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new, unlocked spinlock wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock and returns the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock without touching the interrupt flag.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquires the lock with interrupts disabled on this core.
    ///
    /// The previous interrupt state is restored when the guard drops.
    pub fn lock_irq(&self) -> SpinLockIrqGuard<'_, T> {
        let flags = self.raw.lock_irqsave();
        SpinLockIrqGuard { lock: self, flags }
    }

    /// Attempts [`lock_irq`](Self::lock_irq) once. On failure the
    /// interrupt state is already restored.
    pub fn try_lock_irq(&self) -> Option<SpinLockIrqGuard<'_, T>> {
        self.raw
            .try_lock_irqsave()
            .map(|flags| SpinLockIrqGuard { lock: self, flags })
    }

    /// Whether the lock is currently held. Only a snapshot.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// `&mut self` already guarantees exclusive access, no locking needed.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

// ── IRQ-safe lock ───────────────────────────────────────────────

/// A spinlock that is always taken with interrupts disabled.
///
/// For state shared with interrupt handlers (run queues, wait queues): the
/// type makes it impossible to take the lock the plain way by accident.
pub struct SpinLockIrq<T: ?Sized> {
    inner: SpinLock<T>,
}

impl<T> SpinLockIrq<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> SpinLockIrq<T> {
    /// Disables interrupts on this core and acquires the lock.
    pub fn lock(&self) -> SpinLockIrqGuard<'_, T> {
        self.inner.lock_irq()
    }

    /// Attempts the lock once; interrupt state is untouched on failure.
    pub fn try_lock(&self) -> Option<SpinLockIrqGuard<'_, T>> {
        self.inner.try_lock_irq()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: Default> Default for SpinLockIrq<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLockIrq<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLockIrq").field("data", &&*guard).finish(),
            None => f.write_str("SpinLockIrq { <locked> }"),
        }
    }
}

/// RAII guard of a plain [`SpinLock`] acquisition.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

/// RAII guard of an IRQ-safe [`SpinLock`] acquisition.
///
/// While it exists interrupts are disabled on the holder's core. Dropping
/// it releases the lock first and then restores the interrupt state.
pub struct SpinLockIrqGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    flags: IrqFlags,
}

impl<T: ?Sized> Deref for SpinLockIrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockIrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockIrqGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_irqrestore(self.flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn raw_lock_try_and_release() {
        let lock = RawSpinLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn irq_variant_restores_flags() {
        let lock = SpinLock::new(0u32);
        assert!(irq::enabled());
        {
            let mut guard = lock.lock_irq();
            *guard += 1;
            assert!(!irq::enabled());
        }
        assert!(irq::enabled());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn failed_try_lock_irq_restores_flags() {
        let lock = SpinLock::new(());
        let held = lock.lock();
        assert!(lock.try_lock_irq().is_none());
        assert!(irq::enabled(), "failed try must not leave IRQs off");
        drop(held);
        assert!(lock.try_lock_irq().is_some());
        assert!(irq::enabled());
    }

    #[test]
    fn irq_lock_type_always_disables() {
        let lock = SpinLockIrq::new(5u8);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 5);
            assert!(!irq::enabled());
            assert!(lock.try_lock().is_none());
            assert!(!irq::enabled(), "failed try keeps the holder's state");
        }
        assert!(irq::enabled());
        assert_eq!(lock.into_inner(), 5);
    }

    #[test]
    fn mutual_exclusion_across_cpus() {
        const CPUS: usize = 4;
        const ROUNDS: usize = 20_000;

        let lock = Arc::new(SpinLock::new(0usize));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..CPUS)
            .map(|_| {
                let (lock, inside, max_inside) =
                    (lock.clone(), inside.clone(), max_inside.clone());
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        let mut guard = lock.lock_irq();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        *guard += 1;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(*lock.lock(), CPUS * ROUNDS);
    }
}
