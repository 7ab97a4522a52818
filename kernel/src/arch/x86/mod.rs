//! x86_64 context-switch backends.

mod hwctx;
mod swctx;

pub use hwctx::HwContext;
pub use swctx::SwContext;
