//! Object Module - GC-managed object model
//!
//! Objects are addressed by [`ObjectId`] handles. Rust code keeps them
//! strongly reachable through [`Root`] pins; soft, weak and phantom
//! [`Reference`]s observe them without keeping them alive.

pub mod header;
pub mod reference_queue;
pub mod root;
pub mod weak;

pub use header::{ObjectHeader, ObjectId, HEADER_SIZE, OBJECT_ALIGNMENT, REFERENCE_SIZE};
pub use reference_queue::ReferenceQueue;
pub use root::{FinalizerFn, ObjectBuilder, Root};
pub use weak::{Reference, ReferenceKind, ReferenceState};
