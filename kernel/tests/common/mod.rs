//! Shared helpers for the scheduler-backed tests.
//!
//! Every OS thread is a logical CPU on the hosted platform; a test brings
//! up a scheduler on the CPU it runs on and becomes that CPU's boot thread.
//! Assertions stay on the boot thread (the test's own stack): a panic on a
//! scheduler-managed stack cannot unwind out of it.

#![allow(dead_code)]

use std::sync::mpsc;
use std::time::Duration;

use ukcore::Scheduler;

pub fn bring_up() -> &'static Scheduler {
    klog::init(log::LevelFilter::Warn);
    Scheduler::bring_up().expect("scheduler bring-up")
}

/// Runs `f` on a fresh logical CPU with its own scheduler and returns what
/// it returned.
pub fn on_new_cpu<T, F>(f: F) -> std::thread::JoinHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&'static Scheduler) -> T + Send + 'static,
{
    std::thread::spawn(move || f(bring_up()))
}

/// Receives with a generous timeout so a lost wakeup fails the test
/// instead of hanging it.
pub fn recv<T>(rx: &mpsc::Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(20))
        .expect("no message within 20s")
}
