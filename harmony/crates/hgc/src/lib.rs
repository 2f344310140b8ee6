//! # HGC - Harmony Garbage Collector Runtime
//!
//! HGC is the memory-management core of the Harmony VM: a stop-the-world
//! mark-sweep collector over a handle-based heap, together with the pieces
//! of the runtime that must cooperate with it.
//!
//! ## Overview
//!
//! - **Finalization**: objects may carry a finalizer. It runs exactly once,
//!   on a dedicated low-priority finalizer thread, after the object becomes
//!   unreachable and before its memory is reclaimed. A finalizer may
//!   resurrect its object.
//! - **Reference objects**: soft, weak and phantom references with
//!   [`ReferenceQueue`]s. The collector clears them and delivers each one to
//!   its queue at most once.
//! - **Safepoints**: attached mutator threads poll for safepoints and wrap
//!   long waits in blocking regions, so a collection never waits on a thread
//!   that is parked in `ReferenceQueue::remove`.
//! - **Suspend / resume**: native agents suspend and resume threads with
//!   nesting suspend counts that compose with stop-the-world pauses.
//!
//! ## Quick Start
//!
//! ```rust
//! use hgc::{GcConfig, ObjectBuilder, Runtime};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), hgc::HgcError> {
//!     let runtime = Runtime::new(GcConfig::default())?;
//!     runtime.start()?;
//!
//!     let object = runtime.allocate(
//!         ObjectBuilder::new(64).finalizer(|this| println!("finalizing {}", this.id())),
//!     )?;
//!     let weak = runtime.new_weak_reference(&object, None)?;
//!
//!     drop(object);
//!     runtime.collect()?;
//!     assert!(weak.get().is_none());
//!
//!     runtime.run_finalization(Duration::from_secs(5));
//!     runtime.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Mutator threads (attached)        Native agents         │
//! │   allocate / get_field / poll      suspend / resume      │
//! └──────────────┬──────────────────────────┬────────────────┘
//!                │                          │
//!                ▼                          ▼
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │ GarbageCollector         │──▶│ SafepointManager         │
//! │  mark ▸ refs ▸ sweep     │   │  stop-the-world          │
//! └──────┬───────────┬───────┘   │  suspend counts          │
//!        │           │           └──────────────────────────┘
//!        ▼           ▼
//! ┌────────────┐ ┌──────────────────┐
//! │ Reference  │ │ Finalizer thread │
//! │ queues     │ │ (one, low prio)  │
//! └────────────┘ └──────────────────┘
//! ```
//!
//! ## Thread Safety
//!
//! [`Runtime`] is `Send + Sync` and is normally shared through an `Arc`.
//! [`MutatorThread`] is deliberately neither: an attachment belongs to the
//! OS thread that created it.

pub mod config;
pub mod error;
pub mod gc;
pub mod heap;
pub mod logging;
mod marker;
pub mod object;
pub mod runtime;
pub mod stats;

pub use config::GcConfig;
pub use error::{HgcError, Result};
pub use gc::{CollectionReport, GarbageCollector, GcReason, GcState};
pub use heap::Heap;
pub use logging::{GcEvent, GcLogger, GcLoggerConfig, LogLevel};
pub use object::{
    FinalizerFn, ObjectBuilder, ObjectId, Reference, ReferenceKind, ReferenceQueue, ReferenceState,
    Root,
};
pub use runtime::{
    AgentCapabilities, AgentHandle, MutatorThread, NativeAgent, NativeEvent, NoopAgent, Runtime,
    RuntimeState, ThreadId, ThreadInfo, ThreadStatus,
};
pub use stats::{GcStats, GcSummary};

/// Create and start a runtime with default configuration
pub fn init() -> Result<Runtime> {
    init_with_config(GcConfig::default())
}

/// Create and start a runtime
pub fn init_with_config(config: GcConfig) -> Result<Runtime> {
    let runtime = Runtime::new(config)?;
    runtime.start()?;
    Ok(runtime)
}
