//! Context-switch backends.
//!
//! A backend is the architecture-specific half of a context switch,
//! reduced to four operations:
//!
//! | operation | purpose |
//! |-----------|---------|
//! | `size`    | bytes of one thread's saved-context blob |
//! | `init`    | turn a blank blob into a never-run context that enters the thread trampoline on the given stack and TLS |
//! | `start`   | first activation of a context, abandoning the caller |
//! | `switch`  | save the running context into one blob, resume another |
//!
//! One backend is chosen for the whole system, once, before the first
//! thread is created ([`select_backend`]); everyone else only ever sees the
//! blob as an opaque [`ContextBlob`].

use spin::Once;

use crate::error::SpawnError;
use crate::task::stack::Region;

#[cfg(target_arch = "x86_64")]
pub mod x86;

#[cfg(not(target_arch = "x86_64"))]
compile_error!("ukcore: no context-switch backend for this architecture");

/// Alignment of every context blob (XSAVE needs 64).
pub const BLOB_ALIGN: usize = 64;

/// The four-operation context-switch contract.
///
/// # Safety
///
/// Implementations must honor the contract documented on each method;
/// the scheduler relies on it to move between stacks.
pub unsafe trait ContextBackend: Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Size in bytes of one blob, including any extended-state area.
    fn size(&self) -> usize;

    /// Prepares a never-run context.
    ///
    /// # Safety
    /// `blob` points at `size()` zeroed bytes aligned to [`BLOB_ALIGN`];
    /// `sp` is the 16-byte aligned top of a stack the thread owns; `tls`
    /// is the thread pointer for that thread.
    unsafe fn init(&self, blob: *mut u8, sp: usize, tls: usize);

    /// Activates a context prepared by `init`. Never returns; the caller's
    /// execution state is lost.
    ///
    /// # Safety
    /// Interrupts disabled; `blob` was initialized and never run.
    unsafe fn start(&self, blob: *mut u8) -> !;

    /// Saves the running context into `prev` and resumes `next`. Returns
    /// when some later `switch` resumes `prev`.
    ///
    /// # Safety
    /// Interrupts disabled and no other switch in progress on this CPU;
    /// `prev` belongs to the running thread; `next` was initialized or
    /// saved by an earlier `switch`, and is not running anywhere.
    unsafe fn switch(&self, prev: *mut u8, next: *mut u8);
}

/// One thread's saved execution state. Only the backend reads it.
pub struct ContextBlob {
    region: Region,
}

impl ContextBlob {
    /// Allocates a zeroed blob sized for `backend`.
    pub fn alloc(backend: &dyn ContextBackend) -> Result<Self, SpawnError> {
        Ok(Self {
            region: Region::alloc("context", backend.size(), BLOB_ALIGN)?,
        })
    }

    /// Raw pointer handed to the backend. The bytes behind it are only
    /// touched by the backend, on the CPU that owns the thread.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.len() == 0
    }
}

static BACKEND: Once<&'static dyn ContextBackend> = Once::new();

/// Chooses the system-wide backend.
///
/// Only the first selection counts; returns `false` if a backend was
/// already in place (explicitly, or implicitly by creating a thread).
pub fn select_backend(backend: &'static dyn ContextBackend) -> bool {
    let mut chosen = false;
    BACKEND.call_once(|| {
        chosen = true;
        backend
    });
    if chosen {
        log::info!("context backend: {} ({} bytes/thread)", backend.name(), backend.size());
    }
    chosen
}

/// The system-wide backend, falling back to the build's default.
pub fn backend() -> &'static dyn ContextBackend {
    *BACKEND.call_once(|| {
        let backend = default_backend();
        log::info!("context backend: {} ({} bytes/thread)", backend.name(), backend.size());
        backend
    })
}

#[cfg(all(target_arch = "x86_64", feature = "hw-context"))]
fn default_backend() -> &'static dyn ContextBackend {
    x86::HwContext::get()
}

#[cfg(all(target_arch = "x86_64", not(feature = "hw-context")))]
fn default_backend() -> &'static dyn ContextBackend {
    &x86::SwContext
}
