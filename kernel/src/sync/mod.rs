// =============================================================================
// ukcore: Synchronization primitives
// =============================================================================
//
// Spinlocks are the only primitive that never sleeps; everything else parks
// the caller on a wait queue and lets the scheduler run something else:
//
//   spinlock ─▶ wait queue ─▶ semaphore
//                          ├▶ rwlock
//                          └▶ mutex
//
// Lock ordering (outermost first):
//   1. Primitive state locks   (semaphore count, rwlock state, mutex owner)
//   2. Wait queue locks
//   3. Scheduler run queue locks
//
// NEVER acquire an outer lock while holding an inner one, and never block
// (wait, yield, sleep) while holding any spinlock.
// =============================================================================

pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;
pub mod waitqueue;

pub use mutex::{Mutex, MutexGuard, RawMutex};
pub use rwlock::{RawRwLock, RwLock, RwLockFlags, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard, SpinLockIrq, SpinLockIrqGuard};
pub use waitqueue::WaitQueue;
