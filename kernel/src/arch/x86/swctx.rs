//! Software context: callee-saved registers on the thread's own stack.
//!
//! The blob only records where the stack pointer was left and which TLS
//! pointer the thread runs with. Everything else a suspended thread needs
//! lives on its stack in the frame pushed by `ukcore_sw_switch`:
//!
//! ```text
//!   [sp + 48]  rip (return address into the suspended code)
//!   [sp + 40]  rbp
//!   [sp + 32]  rbx
//!   [sp + 24]  r12
//!   [sp + 16]  r13
//!   [sp +  8]  r14
//!   [sp +  0]  r15   <- SwFrame::sp
//! ```
//!
//! Caller-saved state (including the vector registers) is the compiler's
//! problem: the switch is an ordinary `extern "C"` call.

use crate::arch::ContextBackend;

/// The software blob. Also the header of the hardware blob.
#[repr(C)]
pub(crate) struct SwFrame {
    pub sp: usize,
    pub tls: usize,
}

core::arch::global_asm!(
    ".pushsection .text.ukcore_sw_switch,\"ax\",@progbits",
    ".global ukcore_sw_switch",
    "ukcore_sw_switch:",
    // rdi = &mut prev.sp
    // rsi = &next.sp
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".global ukcore_sw_start",
    "ukcore_sw_start:",
    // rdi = &next.sp; the caller's stack is abandoned
    "mov rsp, [rdi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".popsection",
);

unsafe extern "C" {
    fn ukcore_sw_switch(prev_sp: *mut usize, next_sp: *const usize);
    fn ukcore_sw_start(next_sp: *const usize) -> !;
}

/// Lays out a never-run frame on the stack ending at `top` so that the
/// first switch to it `ret`s into `entry` with a call-aligned stack.
///
/// # Safety
/// `frame` is a valid blob; `top` is the 16-byte aligned top of a stack
/// with at least 64 bytes free below it.
pub(crate) unsafe fn prepare(frame: *mut SwFrame, top: usize, tls: usize, entry: extern "C" fn() -> !) {
    // 6 registers, rip, then a fake return slot: `entry` starts with
    // rsp % 16 == 8 like any freshly called function.
    let sp = (top & !0xF) - 8 * 8;
    let slots = sp as *mut usize;
    unsafe {
        for i in 0..6 {
            slots.add(i).write(0);
        }
        slots.add(6).write(entry as usize);
        slots.add(7).write(0);
        (*frame).sp = sp;
        (*frame).tls = tls;
    }
}

/// Switches stacks, TLS pointers and callee-saved registers.
///
/// # Safety
/// Same contract as [`ContextBackend::switch`], with both blobs at least
/// `size_of::<SwFrame>()` bytes.
pub(crate) unsafe fn switch_frames(prev: *mut SwFrame, next: *const SwFrame) {
    unsafe {
        (*prev).tls = khal::tls::get();
        khal::tls::set((*next).tls);
        ukcore_sw_switch(&raw mut (*prev).sp, &raw const (*next).sp);
    }
}

/// Resumes `next` on its own stack, abandoning the caller.
///
/// # Safety
/// See [`ContextBackend::start`].
pub(crate) unsafe fn start_frame(next: *const SwFrame) -> ! {
    unsafe {
        khal::tls::set((*next).tls);
        ukcore_sw_start(&raw const (*next).sp)
    }
}

/// Callee-saved registers only. The cheapest backend; extended (FPU/SSE/
/// AVX) state is shared by every thread on a CPU.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwContext;

unsafe impl ContextBackend for SwContext {
    fn name(&self) -> &'static str {
        "x86_64-sw"
    }

    fn size(&self) -> usize {
        size_of::<SwFrame>()
    }

    unsafe fn init(&self, blob: *mut u8, sp: usize, tls: usize) {
        unsafe { prepare(blob.cast(), sp, tls, crate::task::thread::trampoline) }
    }

    unsafe fn start(&self, blob: *mut u8) -> ! {
        unsafe { start_frame(blob.cast()) }
    }

    unsafe fn switch(&self, prev: *mut u8, next: *mut u8) {
        unsafe { switch_frames(prev.cast(), next.cast()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::ContextBlob;
    use crate::task::stack::Stack;
    use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

    static MAIN: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());
    static SIDE: AtomicPtr<u8> = AtomicPtr::new(core::ptr::null_mut());
    static ROUNDS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn ping_pong() -> ! {
        loop {
            ROUNDS.fetch_add(1, Ordering::SeqCst);
            unsafe {
                SwContext.switch(SIDE.load(Ordering::SeqCst), MAIN.load(Ordering::SeqCst));
            }
        }
    }

    #[test]
    fn switches_back_and_forth_on_one_cpu() {
        let main = ContextBlob::alloc(&SwContext).unwrap();
        let side = ContextBlob::alloc(&SwContext).unwrap();
        let stack = Stack::alloc(64 * 1024).unwrap();
        MAIN.store(main.as_mut_ptr(), Ordering::SeqCst);
        SIDE.store(side.as_mut_ptr(), Ordering::SeqCst);

        let tls_before = khal::tls::get();
        unsafe { prepare(side.as_mut_ptr().cast(), stack.top(), 0x5000, ping_pong) };

        for round in 1..=3 {
            unsafe { SwContext.switch(main.as_mut_ptr(), side.as_mut_ptr()) };
            assert_eq!(ROUNDS.load(Ordering::SeqCst), round);
            assert_eq!(khal::tls::get(), tls_before, "TLS pointer restored on return");
        }
        // The side context stays suspended; its stack is simply freed.
    }

    #[test]
    fn initial_frame_returns_into_entry() {
        let blob = ContextBlob::alloc(&SwContext).unwrap();
        let stack = Stack::alloc(16 * 1024).unwrap();
        unsafe { prepare(blob.as_mut_ptr().cast(), stack.top(), 7, ping_pong) };

        let frame = unsafe { &*(blob.as_mut_ptr() as *const SwFrame) };
        assert_eq!(frame.tls, 7);
        assert_eq!(frame.sp, stack.top() - 64);
        let rip = unsafe { *((frame.sp + 6 * 8) as *const usize) };
        assert_eq!(rip, ping_pong as usize);
        // After 6 pops and `ret`, rsp sits 8 below a 16-byte boundary.
        assert_eq!((frame.sp + 7 * 8) % 16, 8);
    }
}
