//! Kernel logging subsystem.
//!
//! Implements the `log` facade on top of the khal console, so every crate
//! in the kernel logs with the usual `log::{trace, debug, info, warn,
//! error}` macros. Records are formatted straight into the console with
//! `format_args!`, no allocation involved, which keeps logging usable from
//! the scheduler and from interrupt context.
#![cfg_attr(not(test), no_std)]

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Fixed-width label for a level.
pub fn label(level: Level) -> &'static str {
    match level {
        Level::Trace => "TRACE",
        Level::Debug => "DEBUG",
        Level::Info => " INFO",
        Level::Warn => " WARN",
        Level::Error => "ERROR",
    }
}

/// ANSI color used for a level's label.
pub fn color(level: Level) -> &'static str {
    match level {
        Level::Trace => "\x1b[90m", // Gray
        Level::Debug => "\x1b[36m", // Cyan
        Level::Info => "\x1b[32m",  // Green
        Level::Warn => "\x1b[33m",  // Yellow
        Level::Error => "\x1b[31m", // Red
    }
}

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = record.level();
        khal::console::write_fmt(format_args!(
            "{}[{}]\x1b[0m {}: {}\n",
            color(level),
            label(level),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Installs the kernel logger and sets the maximum level.
///
/// Calling it again only changes the level.
pub fn init(level: LevelFilter) {
    khal::console::init();
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_fixed_width() {
        for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
            assert_eq!(label(level).len(), 5);
        }
    }

    #[test]
    fn init_is_idempotent_and_sets_level() {
        init(LevelFilter::Debug);
        init(LevelFilter::Warn);
        assert_eq!(log::max_level(), LevelFilter::Warn);
        assert!(!LOGGER.enabled(&Metadata::builder().level(Level::Info).build()));
        assert!(LOGGER.enabled(&Metadata::builder().level(Level::Error).build()));
    }
}
