//! Per-core identification and CPU hints.

/// Returns the index of the logical CPU executing the caller.
///
/// Bare metal: the boot layer points GS at a per-core block whose first
/// `u32` is the core index (0 = BSP). Hosted: each OS thread is assigned
/// the next free index the first time it asks.
#[inline]
pub fn id() -> usize {
    imp::id()
}

/// Spin-loop hint (PAUSE on x86_64).
#[inline(always)]
pub fn relax() {
    core::hint::spin_loop();
}

/// Parks the CPU until something may have changed.
///
/// Bare metal: enables interrupts and executes HLT atomically, so a wakeup
/// IRQ arriving between the check and the halt is not lost. Hosted: gives
/// the OS thread's timeslice away.
#[inline]
pub fn halt() {
    imp::halt();
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod imp {
    #[inline]
    pub fn id() -> usize {
        let id: u32;
        // SAFETY: the boot layer installs the per-core block before any
        // scheduler code runs; offset 0 is the core index.
        unsafe {
            core::arch::asm!(
                "mov {:e}, gs:[0]",
                out(reg) id,
                options(nomem, nostack, preserves_flags)
            );
        }
        id as usize
    }

    #[inline]
    pub fn halt() {
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_LCPU: AtomicUsize = AtomicUsize::new(0);

    std::thread_local! {
        static LCPU: usize = NEXT_LCPU.fetch_add(1, Ordering::Relaxed);
    }

    pub fn id() -> usize {
        LCPU.with(|id| *id)
    }

    pub fn halt() {
        std::thread::yield_now();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_distinct_per_os_thread() {
        let me = id();
        assert_eq!(me, id());
        let other = std::thread::spawn(id).join().unwrap();
        assert_ne!(me, other);
    }
}
