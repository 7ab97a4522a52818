//! Threads and per-CPU scheduling.

pub mod clock;
pub mod sched;
pub(crate) mod stack;
pub mod thread;

pub use sched::{SchedStats, Scheduler};
pub use thread::{Thread, ThreadBuilder, ThreadFlags, ThreadId, ThreadState};
