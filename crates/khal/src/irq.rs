// =============================================================================
// Interrupt-enable flag management
// =============================================================================
//
// Spinlocks that can be taken from interrupt context and the context switch
// path both need to run with maskable interrupts off on the current core.
// The pattern is always the same:
//
//     let flags = irq::save_and_disable();
//     ... critical section ...
//     irq::restore(flags);
//
// `restore` only re-enables interrupts if they were enabled when the flags
// were saved, so nested save/restore pairs compose.
//
// On hosted targets the flag is emulated per OS thread (= per logical CPU).
// =============================================================================

/// Saved interrupt-enable state, returned by [`save_and_disable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "interrupt state must be restored with irq::restore"]
pub struct IrqFlags {
    were_enabled: bool,
}

impl IrqFlags {
    /// Whether interrupts were enabled when this state was captured.
    pub fn were_enabled(self) -> bool {
        self.were_enabled
    }
}

/// Checks whether maskable interrupts are currently enabled on this core.
#[inline(always)]
pub fn enabled() -> bool {
    imp::enabled()
}

/// Disables maskable interrupts on the current core.
#[inline(always)]
pub fn disable() {
    imp::disable();
}

/// Enables maskable interrupts on the current core.
#[inline(always)]
pub fn enable() {
    imp::enable();
}

/// Disables interrupts and returns the state they were in before.
#[inline(always)]
pub fn save_and_disable() -> IrqFlags {
    let were_enabled = imp::enabled();
    imp::disable();
    IrqFlags { were_enabled }
}

/// Restores the interrupt state captured by [`save_and_disable`].
#[inline(always)]
pub fn restore(flags: IrqFlags) {
    if flags.were_enabled {
        imp::enable();
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod imp {
    use x86_64::instructions::interrupts;

    #[inline(always)]
    pub fn enabled() -> bool {
        interrupts::are_enabled()
    }

    #[inline(always)]
    pub fn disable() {
        interrupts::disable();
    }

    #[inline(always)]
    pub fn enable() {
        interrupts::enable();
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use std::cell::Cell;

    std::thread_local! {
        static ENABLED: Cell<bool> = const { Cell::new(true) };
    }

    pub fn enabled() -> bool {
        ENABLED.with(Cell::get)
    }

    pub fn disable() {
        ENABLED.with(|e| e.set(false));
    }

    pub fn enable() {
        ENABLED.with(|e| e.set(true));
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn nested_save_restore_keeps_outer_state() {
        assert!(enabled());
        let outer = save_and_disable();
        assert!(!enabled());
        let inner = save_and_disable();
        assert!(!inner.were_enabled());
        restore(inner);
        assert!(!enabled(), "inner restore must not re-enable");
        restore(outer);
        assert!(enabled());
    }

    #[test]
    fn flag_is_per_logical_cpu() {
        disable();
        let other = std::thread::spawn(enabled).join().unwrap();
        assert!(other);
        enable();
    }
}
