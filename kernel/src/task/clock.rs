//! Scheduler time: nanosecond timestamps, deadlines and the tick counter.
//!
//! A deadline is an absolute [`now`] value. [`NEVER`] (0) means "no
//! deadline"; every real deadline is at least 1 so it can never be mistaken
//! for it.

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

/// The "wait forever" deadline.
pub const NEVER: u64 = 0;

/// Global tick counter.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Called from [`Scheduler::timer_tick`](crate::task::Scheduler::timer_tick).
#[inline]
pub(crate) fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Timer ticks observed so far, across all CPUs.
#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Current monotonic time in nanoseconds.
#[inline]
pub fn now() -> u64 {
    khal::clock::now_ns()
}

/// `d` in nanoseconds, saturating.
#[inline]
pub fn as_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// The deadline `d` from now.
pub fn deadline_after(d: Duration) -> u64 {
    now().saturating_add(as_ns(d)).max(1)
}

/// Whether `deadline` is real and has passed.
#[inline]
pub fn expired(deadline: u64) -> bool {
    deadline != NEVER && now() >= deadline
}

/// Time since `start` (a [`now`] value).
pub fn since(start: u64) -> Duration {
    Duration::from_nanos(now().saturating_sub(start))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_does_not_expire() {
        std::thread::sleep(Duration::from_millis(1));
        assert!(!expired(NEVER));
        assert!(expired(1));
    }

    #[test]
    fn deadlines_are_real_and_ordered() {
        let a = deadline_after(Duration::ZERO);
        let b = deadline_after(Duration::from_millis(5));
        assert!(a >= 1);
        assert!(b >= a + 5_000_000);
        assert_eq!(deadline_after(Duration::MAX), u64::MAX);
    }
}
