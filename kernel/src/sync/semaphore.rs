//! Counting semaphore.
//!
//! The count only changes under its lock. `down` returns only after it
//! saw the count above zero and decremented it in the same critical
//! section; `up` increments and then wakes every waiter, which re-check
//! and race for the new unit(s).

use core::fmt;
use core::time::Duration;

use crate::error::{TimedOut, WaitStatus};
use crate::sync::{SpinLockIrq, WaitQueue};
use crate::task::clock;

pub struct Semaphore {
    count: SpinLockIrq<usize>,
    waiters: WaitQueue,
}

impl Semaphore {
    pub const fn new(count: usize) -> Self {
        Self {
            count: SpinLockIrq::new(count),
            waiters: WaitQueue::new(),
        }
    }

    /// Takes one unit if one is available right now.
    fn take(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Takes one unit, blocking until one is available.
    pub fn down(&self) {
        self.waiters.wait(|| self.take());
    }

    /// Takes one unit only if the count is positive at this instant.
    pub fn down_try(&self) -> bool {
        self.take()
    }

    /// Like [`down`](Self::down) but gives up after `timeout`. On success
    /// returns how long it waited.
    pub fn down_with_timeout(&self, timeout: Duration) -> Result<Duration, TimedOut> {
        let start = clock::now();
        if timeout.is_zero() {
            return if self.take() { Ok(Duration::ZERO) } else { Err(TimedOut) };
        }
        match self
            .waiters
            .wait_deadline(clock::deadline_after(timeout), || self.take())
        {
            WaitStatus::Satisfied => Ok(clock::since(start)),
            WaitStatus::TimedOut => Err(TimedOut),
        }
    }

    /// Returns one unit and wakes the waiters.
    pub fn up(&self) {
        self.up_n(1);
    }

    /// Returns `n` units at once.
    pub fn up_n(&self, n: usize) {
        if n == 0 {
            return;
        }
        {
            let mut count = self.count.lock();
            *count = count.checked_add(n).expect("semaphore count overflow");
        }
        self.waiters.wake_all();
    }

    /// Current count. Only a snapshot.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // None of these block, so no scheduler is needed on the test thread.

    #[test]
    fn try_takes_only_available_units() {
        let sem = Semaphore::new(2);
        assert!(sem.down_try());
        assert!(sem.down_try());
        assert!(!sem.down_try());
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn up_without_waiters_accumulates() {
        let sem = Semaphore::new(0);
        sem.up();
        sem.up_n(3);
        sem.up_n(0);
        assert_eq!(sem.count(), 4);
    }

    #[test]
    fn zero_timeout_is_a_single_try() {
        let sem = Semaphore::new(1);
        assert_eq!(sem.down_with_timeout(Duration::ZERO), Ok(Duration::ZERO));
        assert_eq!(sem.down_with_timeout(Duration::ZERO), Err(TimedOut));
    }

    #[test]
    fn available_unit_needs_no_wait() {
        let sem = Semaphore::new(2);
        sem.down();
        assert!(sem.down_with_timeout(Duration::from_secs(1)).is_ok());
        assert_eq!(sem.count(), 0);
    }
}
