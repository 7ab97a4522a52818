//! Compile-time configuration.

use core::time::Duration;

/// Maximum number of logical CPUs a scheduler can be brought up on.
pub const MAX_LCPUS: usize = 64;

/// Default stack size for new threads (and for each CPU's idle thread).
#[cfg(target_os = "none")]
pub const DEFAULT_STACK_SIZE: usize = 4096 * 16;
/// Default stack size for new threads (and for each CPU's idle thread).
///
/// Hosted builds run std code (formatting, test capture) on these stacks.
#[cfg(not(target_os = "none"))]
pub const DEFAULT_STACK_SIZE: usize = 4096 * 64;

/// Smallest stack a thread may be created with.
pub const MIN_STACK_SIZE: usize = 4096 * 2;

/// Default size of a thread's static TLS block, excluding the TCB word.
pub const DEFAULT_TLS_SIZE: usize = 256;

/// Priority given to threads that do not ask for one.
pub const DEFAULT_PRIORITY: u8 = 128;

/// Timeslice given to threads that do not ask for one. `None` means the
/// thread runs until it yields or blocks.
pub const DEFAULT_TIMESLICE: Option<Duration> = None;
