//! Hardware Abstraction Layer.
//!
//! Everything the concurrency core needs from the platform lives behind
//! this crate: the interrupt-enable flag, the logical CPU number, the
//! monotonic clock, the TLS base register and a console for the logger.
//!
//! Two implementations exist:
//!   - bare metal (`target_os = "none"`, x86_64): real RFLAGS.IF, GS-based
//!     per-core id, FS base MSR, COM1 serial.
//!   - hosted (any other target): every OS thread plays the role of one
//!     logical CPU. The interrupt flag and TLS register are emulated per
//!     OS thread, the clock is `std::time::Instant` and the console is
//!     stderr. This is what the test suites run on.
#![cfg_attr(target_os = "none", no_std)]

#[cfg(all(target_os = "none", not(target_arch = "x86_64")))]
compile_error!("khal: bare-metal support is only implemented for x86_64");

pub mod clock;
pub mod console;
pub mod cpu;
pub mod irq;
pub mod tls;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub mod serial;

pub use irq::IrqFlags;
