//! Memory regions owned by a thread: stack, TLS block, context blob.

use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use core::ptr::NonNull;

use crate::error::SpawnError;

/// A zero-initialized, exclusively owned heap region.
pub(crate) struct Region {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is plain memory owned by exactly one `Region`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn alloc(what: &'static str, size: usize, align: usize) -> Result<Self, SpawnError> {
        let oom = SpawnError::OutOfMemory { what, size };
        let layout = Layout::from_size_align(size.max(1), align).map_err(|_| oom)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(oom)?;
        Ok(Self { base, layout })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    /// One past the last byte.
    pub(crate) fn end(&self) -> usize {
        self.base.as_ptr() as usize + self.layout.size()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated in `Region::alloc` with this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// A thread's stack. Grows downwards from [`Stack::top`].
pub(crate) struct Stack {
    region: Region,
}

impl Stack {
    pub(crate) fn alloc(size: usize) -> Result<Self, SpawnError> {
        Ok(Self {
            region: Region::alloc("stack", size, 16)?,
        })
    }

    /// Initial stack pointer, 16-byte aligned.
    pub(crate) fn top(&self) -> usize {
        self.region.end() & !0xF
    }

    pub(crate) fn size(&self) -> usize {
        self.region.len()
    }
}

/// A static TLS block followed by the thread control block word.
///
/// x86_64 uses TLS variant II: the thread pointer addresses the TCB, the
/// TLS data sits just below it, and the first TCB word holds the thread
/// pointer itself (`%fs:0` must read back the FS base).
pub(crate) struct TlsArea {
    region: Region,
    tp: usize,
}

impl TlsArea {
    pub(crate) fn alloc(size: usize) -> Result<Self, SpawnError> {
        let data = (size + 15) & !15;
        let region = Region::alloc("tls", data + 16, 16)?;
        let tp = region.as_ptr() as usize + data;
        // SAFETY: `tp` is inside the region, 16-byte aligned, and the TCB
        // word fits in the 16 bytes reserved after the data.
        unsafe { (tp as *mut usize).write(tp) };
        Ok(Self { region, tp })
    }

    /// Value to load into the TLS base register.
    pub(crate) fn pointer(&self) -> usize {
        self.tp
    }

    pub(crate) fn size(&self) -> usize {
        self.region.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_top_is_aligned_and_inside() {
        let stack = Stack::alloc(8192 + 8).unwrap();
        assert_eq!(stack.top() % 16, 0);
        assert!(stack.top() <= stack.region.end());
        assert!(stack.top() > stack.region.as_ptr() as usize);
    }

    #[test]
    fn tls_tcb_points_at_itself() {
        let tls = TlsArea::alloc(100).unwrap();
        let tp = tls.pointer();
        assert_eq!(tp % 16, 0);
        assert_eq!(unsafe { *(tp as *const usize) }, tp);
        assert!(tls.size() >= 100 + 8);
    }

    #[test]
    fn regions_start_zeroed() {
        let region = Region::alloc("test", 256, 64).unwrap();
        assert_eq!(region.as_ptr() as usize % 64, 0);
        let bytes = unsafe { core::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
