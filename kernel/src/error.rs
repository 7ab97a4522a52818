//! Recoverable outcomes of core operations.
//!
//! Misuse (invalid references, recursive write locks, unlocking a mutex
//! one does not own, bad thread attributes) is not represented here: it
//! panics, because the broken invariant cannot be trusted afterwards.

use core::fmt;

/// A deadline elapsed before the awaited condition held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("timed out")
    }
}

/// How a condition wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a deadline wait may end without the condition holding"]
pub enum WaitStatus {
    /// The condition held when the wait returned.
    Satisfied,
    /// The deadline passed first; the condition was false at the last check.
    TimedOut,
}

impl WaitStatus {
    pub fn timed_out(self) -> bool {
        self == WaitStatus::TimedOut
    }
}

/// Why a thread could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The allocator could not provide the named region.
    OutOfMemory { what: &'static str, size: usize },
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::OutOfMemory { what, size } => {
                write!(f, "out of memory allocating {} ({} bytes)", what, size)
            }
        }
    }
}
