// =============================================================================
// ukcore: Unikernel Concurrency Core
// =============================================================================
//
// Everything a unikernel needs to run more than one thing at a time:
//
//   sync/     spinlocks, wait queues, semaphores, rwlocks, mutexes
//   arch/     context-switch backends (callee-saved only / + XSAVE)
//   task/     threads, per-CPU schedulers, scheduler clock
//
// BRING-UP, per logical CPU:
//   1. Scheduler::bring_up()      adopt the running context as "boot"
//   2. ThreadBuilder::spawn(..)   create threads
//   3. either keep running as the boot thread (it blocks and yields like
//      any other), or Scheduler::start(first) to leave the boot context
//      behind for good
//
// The backend is chosen once, before the first thread is created, with
// arch::select_backend(); otherwise the build default is used.
//
// The crate is #![no_std] + alloc: a global allocator must be installed
// before bring-up. Platform services come from `khal`.
// =============================================================================

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod config;
pub mod error;
pub mod sync;
pub mod task;

pub use error::{SpawnError, TimedOut, WaitStatus};
pub use sync::{Mutex, RwLock, Semaphore, SpinLock, SpinLockIrq, WaitQueue};
pub use task::{SchedStats, Scheduler, Thread, ThreadBuilder, ThreadId, ThreadState};
