//! Hardware context: software frame plus the CPU's extended state.
//!
//! Blob layout:
//!
//! ```text
//!   [0 .. 64)        SwFrame (sp, tls), padded
//!   [64 .. 64+area)  XSAVE area (or 512-byte FXSAVE area)
//! ```
//!
//! The extended area is 64-byte aligned because the blob is. A fresh blob
//! has an all-zero XSAVE header, so the first restore puts every component
//! in its init state; only the x87 control word and MXCSR are seeded.

use core::arch::x86_64::{__cpuid, __cpuid_count, _fxrstor64, _fxsave64, _xrstor64, _xsave64};

use spin::Once;

use super::swctx::{self, SwFrame};
use crate::arch::ContextBackend;

/// Offset of the extended-state area inside the blob.
const EXT_OFFSET: usize = 64;

const _: () = assert!(size_of::<SwFrame>() <= EXT_OFFSET);
const _: () = assert!(EXT_OFFSET % crate::arch::BLOB_ALIGN == 0);

/// Size of the legacy FXSAVE image.
const FXSAVE_SIZE: usize = 512;

/// x87 FPU control word after FNINIT.
const FCW_DEFAULT: u16 = 0x037F;
/// MXCSR after reset: all exceptions masked, round to nearest.
const MXCSR_DEFAULT: u32 = 0x1F80;

/// AMX tile state (XTILECFG, XTILEDATA). Hosts gate it per process, so
/// it is never part of a thread's context.
const XCR0_AMX: u64 = (1 << 17) | (1 << 18);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mechanism {
    Xsave { mask: u64 },
    Fxsave,
}

/// Software frame plus XSAVE (or FXSAVE when XSAVE is unavailable).
#[derive(Debug)]
pub struct HwContext {
    mechanism: Mechanism,
    area: usize,
}

impl HwContext {
    /// Probes the CPU for the save mechanism and area size.
    pub fn detect() -> Self {
        #[allow(unused_unsafe)]
        let leaf1 = unsafe { __cpuid(1) };
        let xsave = leaf1.ecx & (1 << 26) != 0;
        let osxsave = leaf1.ecx & (1 << 27) != 0;

        if xsave && osxsave {
            let mask = x86_64::registers::xcontrol::XCr0::read_raw() & !XCR0_AMX;
            // EBX: bytes needed for the components enabled in XCR0.
            #[allow(unused_unsafe)]
            let leaf_d = unsafe { __cpuid_count(0xD, 0) };
            Self {
                mechanism: Mechanism::Xsave { mask },
                area: (leaf_d.ebx as usize).max(FXSAVE_SIZE + 64),
            }
        } else {
            Self {
                mechanism: Mechanism::Fxsave,
                area: FXSAVE_SIZE,
            }
        }
    }

    /// The system-wide instance, probed on first use.
    pub fn get() -> &'static HwContext {
        static HW: Once<HwContext> = Once::new();
        HW.call_once(Self::detect)
    }

    /// Whether XSAVE (rather than FXSAVE) is in use.
    pub fn uses_xsave(&self) -> bool {
        matches!(self.mechanism, Mechanism::Xsave { .. })
    }

    /// Bytes of extended state per thread.
    pub fn area_size(&self) -> usize {
        self.area
    }

    unsafe fn save(&self, area: *mut u8) {
        unsafe {
            match self.mechanism {
                Mechanism::Xsave { mask } => xsave(area, mask),
                Mechanism::Fxsave => fxsave(area),
            }
        }
    }

    unsafe fn restore(&self, area: *const u8) {
        unsafe {
            match self.mechanism {
                Mechanism::Xsave { mask } => xrstor(area, mask),
                Mechanism::Fxsave => fxrstor(area),
            }
        }
    }
}

#[target_feature(enable = "xsave")]
unsafe fn xsave(area: *mut u8, mask: u64) {
    unsafe { _xsave64(area, mask) }
}

#[target_feature(enable = "xsave")]
unsafe fn xrstor(area: *const u8, mask: u64) {
    unsafe { _xrstor64(area, mask) }
}

#[target_feature(enable = "fxsr")]
unsafe fn fxsave(area: *mut u8) {
    unsafe { _fxsave64(area) }
}

#[target_feature(enable = "fxsr")]
unsafe fn fxrstor(area: *const u8) {
    unsafe { _fxrstor64(area) }
}

unsafe impl ContextBackend for HwContext {
    fn name(&self) -> &'static str {
        match self.mechanism {
            Mechanism::Xsave { .. } => "x86_64-xsave",
            Mechanism::Fxsave => "x86_64-fxsave",
        }
    }

    fn size(&self) -> usize {
        EXT_OFFSET + self.area
    }

    unsafe fn init(&self, blob: *mut u8, sp: usize, tls: usize) {
        unsafe {
            swctx::prepare(blob.cast::<SwFrame>(), sp, tls, crate::task::thread::trampoline);
            let ext = blob.add(EXT_OFFSET);
            ext.cast::<u16>().write(FCW_DEFAULT);
            ext.add(24).cast::<u32>().write(MXCSR_DEFAULT);
        }
    }

    unsafe fn start(&self, blob: *mut u8) -> ! {
        unsafe {
            self.restore(blob.add(EXT_OFFSET));
            swctx::start_frame(blob.cast())
        }
    }

    unsafe fn switch(&self, prev: *mut u8, next: *mut u8) {
        unsafe {
            self.save(prev.add(EXT_OFFSET));
            self.restore(next.add(EXT_OFFSET));
            swctx::switch_frames(prev.cast(), next.cast());
        }
    }
}
