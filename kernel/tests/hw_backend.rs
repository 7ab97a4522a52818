//! Threads scheduled with the hardware-assisted backend keep their own
//! SSE control state across switches.
//!
//! The backend is process-wide, so this file holds a single test that
//! selects it before any thread exists.

#![cfg(target_arch = "x86_64")]

mod common;

use std::arch::asm;
use std::sync::Arc;

use ukcore::arch::{self, ContextBackend, x86::HwContext};
use ukcore::task::thread;
use ukcore::{SpinLock, ThreadBuilder};

fn mxcsr() -> u32 {
    let mut value = 0u32;
    unsafe { asm!("stmxcsr dword ptr [{}]", in(reg) &raw mut value, options(nostack)) };
    value
}

fn set_mxcsr(value: u32) {
    unsafe { asm!("ldmxcsr dword ptr [{}]", in(reg) &raw const value, options(nostack)) };
}

/// Rounding-control bits.
const RC_MASK: u32 = 0x6000;

#[test]
fn rounding_mode_is_per_thread() {
    assert!(arch::select_backend(HwContext::get()));
    assert_eq!(arch::backend().name(), HwContext::get().name());
    common::bring_up();

    let seen = Arc::new(SpinLock::new(Vec::new()));
    let workers: Vec<_> = [0x0000u32, 0x2000, 0x4000, 0x6000]
        .into_iter()
        .map(|rc| {
            let seen = seen.clone();
            ThreadBuilder::new()
                .spawn(move || {
                    // Every thread starts from the reset value.
                    let initial = mxcsr() & RC_MASK;
                    set_mxcsr((mxcsr() & !RC_MASK) | rc);
                    for _ in 0..3 {
                        thread::yield_now();
                    }
                    seen.lock().push((rc, initial, mxcsr() & RC_MASK));
                })
                .unwrap()
        })
        .collect();

    let mine = mxcsr();
    for worker in &workers {
        worker.join();
    }
    assert_eq!(mxcsr(), mine, "boot thread's MXCSR untouched");

    let seen = seen.lock();
    assert_eq!(seen.len(), 4);
    for &(rc, initial, after) in seen.iter() {
        assert_eq!(initial, 0, "fresh threads round to nearest");
        assert_eq!(after, rc, "rounding mode survived the switches");
    }
}
