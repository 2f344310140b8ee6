//! Harmony Runtime Library
//!
//! C ABI over the HGC runtime for the VM's native side:
//! - Runtime creation and shutdown
//! - Object and weak reference handles
//! - Collection and finalization
//! - Thread attachment, safepoints and suspension

mod gc;

pub use gc::*;
