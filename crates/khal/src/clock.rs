//! Monotonic system clock.
//!
//! Nanoseconds since the clock was first read. On bare metal the platform
//! timer interrupt drives it forward with [`advance`]; hosted builds read
//! `std::time::Instant` and add whatever has been injected with
//! [`advance`] on top.

use core::sync::atomic::{AtomicU64, Ordering};

/// Nanoseconds added by [`advance`].
static OFFSET_NS: AtomicU64 = AtomicU64::new(0);

/// Moves the clock forward by `ns`.
///
/// Called by the timer interrupt handler on every tick with the tick
/// period.
#[inline]
pub fn advance(ns: u64) {
    OFFSET_NS.fetch_add(ns, Ordering::Relaxed);
}

/// Current monotonic time in nanoseconds.
#[inline]
pub fn now_ns() -> u64 {
    imp::base_ns().saturating_add(OFFSET_NS.load(Ordering::Relaxed))
}

#[cfg(target_os = "none")]
mod imp {
    #[inline]
    pub fn base_ns() -> u64 {
        0
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use std::sync::OnceLock;
    use std::time::Instant;

    static EPOCH: OnceLock<Instant> = OnceLock::new();

    pub fn base_ns() -> u64 {
        let nanos = EPOCH.get_or_init(Instant::now).elapsed().as_nanos();
        u64::try_from(nanos).unwrap_or(u64::MAX)
    }
}
