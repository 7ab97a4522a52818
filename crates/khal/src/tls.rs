//! Thread-local storage base register.
//!
//! x86_64 addresses TLS through the FS segment base. The context switch
//! path reads the outgoing thread's value and installs the incoming one.
//! Hosted builds keep the value in an emulated per-CPU register: the real
//! FS base belongs to the host's own TLS and must not be touched.

/// Reads the current TLS pointer.
#[inline]
pub fn get() -> usize {
    imp::get()
}

/// Installs `tp` as the TLS pointer of this CPU.
///
/// # Safety
/// `tp` must point at a TLS block laid out for the running code (or be 0
/// for code that never touches TLS). Anything reading thread-locals after
/// this call goes through the new block.
#[inline]
pub unsafe fn set(tp: usize) {
    unsafe { imp::set(tp) }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod imp {
    use x86_64::registers::model_specific::FsBase;
    use x86_64::VirtAddr;

    #[inline]
    pub fn get() -> usize {
        FsBase::read().as_u64() as usize
    }

    #[inline]
    pub unsafe fn set(tp: usize) {
        #[allow(unused_unsafe)]
        unsafe {
            FsBase::write(VirtAddr::new_truncate(tp as u64));
        }
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    use std::cell::Cell;

    std::thread_local! {
        static TP: Cell<usize> = const { Cell::new(0) };
    }

    pub fn get() -> usize {
        TP.with(Cell::get)
    }

    pub unsafe fn set(tp: usize) {
        TP.with(|t| t.set(tp));
    }
}
