//! Kernel console sink used by the logger.

use core::fmt;

/// Prepares the console for output. Safe to call more than once.
pub fn init() {
    imp::init();
}

/// Writes a string to the console.
pub fn write_str(s: &str) {
    imp::write_fmt(format_args!("{}", s));
}

/// Writes formatted arguments to the console.
pub fn write_fmt(args: fmt::Arguments<'_>) {
    imp::write_fmt(args);
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod imp {
    use core::fmt;

    pub fn init() {
        crate::serial::init();
    }

    pub fn write_fmt(args: fmt::Arguments<'_>) {
        crate::serial::write_fmt(args);
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use core::fmt;

    pub fn init() {}

    pub fn write_fmt(args: fmt::Arguments<'_>) {
        // Goes through the test harness output capture.
        std::eprint!("{}", args);
    }
}
