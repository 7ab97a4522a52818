// =============================================================================
// ukcore: Wait queues
// =============================================================================
//
// A wait queue is the list of threads blocked until some condition holds.
// The condition itself lives elsewhere (a counter, a lock word, a thread
// state); the queue only remembers who to poke when it may have changed.
//
// THE WAIT LOOP (wait_deadline):
//   1. condition already true?            -> return
//   2. IRQs off; enqueue self (idempotent); record deadline; mark Blocked;
//      tell the scheduler; IRQs back
//   3. condition true or deadline passed? -> stop
//   4. otherwise give up the CPU, then go to 2
//   5. IRQs off; back to Running; dequeue self; IRQs back
//
// Because the caller is enqueued and marked Blocked *before* it re-checks
// the condition, a waker that changes the condition and then wakes the
// queue can never slip in between the check and the sleep: either the
// check sees the change, or the wake sees the Blocked state.
//
// WAKES ARE HINTS: wake_one/wake_all make threads runnable but leave them
// in the queue. Each woken thread re-checks its condition and removes
// itself when done, so a spurious or stale wake costs one extra check.
//
// =============================================================================

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::time::Duration;

use khal::irq;

use crate::error::WaitStatus;
use crate::sync::SpinLockIrq;
use crate::task::clock;
use crate::task::sched::Scheduler;
use crate::task::thread::{Thread, ThreadState};

/// FIFO of threads waiting for a condition.
pub struct WaitQueue {
    waiters: SpinLockIrq<VecDeque<Arc<Thread>>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLockIrq::new(VecDeque::new()),
        }
    }

    /// Enqueues `thread` unless it is already queued. Returns whether it
    /// was added.
    pub fn add(&self, thread: &Arc<Thread>) -> bool {
        let mut waiters = self.waiters.lock();
        if waiters.iter().any(|t| Arc::ptr_eq(t, thread)) {
            return false;
        }
        waiters.push_back(thread.clone());
        true
    }

    /// Dequeues `thread` if it is queued. Returns whether it was removed.
    pub fn remove(&self, thread: &Arc<Thread>) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.iter().position(|t| Arc::ptr_eq(t, thread)) {
            Some(pos) => {
                waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, thread: &Arc<Thread>) -> bool {
        self.waiters.lock().iter().any(|t| Arc::ptr_eq(t, thread))
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Wakes the first waiter that is actually asleep. Returns `false` if
    /// there was none.
    pub fn wake_one(&self) -> bool {
        let waiters = self.waiters.lock();
        waiters
            .iter()
            .filter(|t| t.state() == ThreadState::Blocked)
            .any(|t| t.scheduler().wake(t))
    }

    /// Wakes every waiter. Returns how many were asleep.
    pub fn wake_all(&self) -> usize {
        let waiters = self.waiters.lock();
        waiters.iter().filter(|t| t.scheduler().wake(t)).count()
    }

    /// Blocks until `cond` returns `true`.
    ///
    /// `cond` runs on every wake and may have side effects: the first call
    /// that returns `true` is the last one.
    pub fn wait(&self, cond: impl FnMut() -> bool) {
        let status = self.wait_deadline(clock::NEVER, cond);
        debug_assert_eq!(status, WaitStatus::Satisfied);
    }

    /// Blocks for at most `timeout` until `cond` returns `true`.
    pub fn wait_timeout(&self, timeout: Duration, cond: impl FnMut() -> bool) -> WaitStatus {
        self.wait_deadline(clock::deadline_after(timeout), cond)
    }

    /// Blocks until `cond` returns `true` or the clock reaches `deadline`
    /// ([`clock::NEVER`] waits forever). On `TimedOut` the condition was
    /// false at the last check.
    pub fn wait_deadline(&self, deadline: u64, mut cond: impl FnMut() -> bool) -> WaitStatus {
        if cond() {
            return WaitStatus::Satisfied;
        }

        let sched = Scheduler::this_cpu();
        let me = sched.current();
        assert!(!me.is_idle(), "the idle thread cannot block");

        let status = loop {
            let flags = irq::save_and_disable();
            self.add(&me);
            me.set_wakeup_deadline(deadline);
            me.set_state(ThreadState::Blocked);
            sched.block(&me);
            irq::restore(flags);

            if cond() {
                break WaitStatus::Satisfied;
            }
            if clock::expired(deadline) {
                break WaitStatus::TimedOut;
            }
            sched.reschedule();
        };

        let flags = irq::save_and_disable();
        sched.unblock(&me);
        self.remove(&me);
        irq::restore(flags);
        status
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue").field("len", &self.len()).finish()
    }
}
