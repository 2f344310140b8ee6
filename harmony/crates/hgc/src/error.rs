//! Error Module - HGC Error Types
//!
//! Defines all error types used in HGC.
//!
//! # Error Categories
//!
//! ## Memory Errors
//! - `OutOfMemory` - Heap exhaustion after soft references were cleared
//! - `InvalidObject` - Stale or foreign object handle
//! - `BoundsCheckFailed` - Field index outside the object's field count
//!
//! ## Thread Errors
//! - `ThreadNotFound` - Unknown or detached thread id
//! - `ThreadAlreadyAttached` - Current OS thread already attached
//! - `ThreadSpawn` - Finalizer thread could not be created
//! - `Interrupted` - Blocking wait cancelled by `interrupt`
//! - `Timeout` - Safepoint or shutdown deadline exceeded
//!
//! ## Runtime Errors
//! - `Configuration` - Invalid configuration
//! - `InvalidState` - Runtime lifecycle violation
//! - `MissingCapability` - Agent used an operation it did not declare
//! - `ShutDown` - Runtime already stopped
//! - `Internal` - Invariant violation

use crate::object::ObjectId;
use crate::runtime::ThreadId;
use thiserror::Error;

/// Main error type for all HGC operations
///
/// # Examples
///
/// ```rust
/// use hgc::error::HgcError;
///
/// fn handle_error(err: HgcError) {
///     match err {
///         HgcError::OutOfMemory { requested, available } => {
///             eprintln!("OOM: requested {}, available {}", requested, available);
///         }
///         HgcError::Interrupted => {
///             eprintln!("wait interrupted");
///         }
///         _ => {
///             eprintln!("Other error: {}", err);
///         }
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum HgcError {
    /// Out of memory - heap exhaustion
    ///
    /// **When returned:** Allocation still does not fit after an
    /// allocation-failure collection and an emergency collection that
    /// cleared every soft reference.
    ///
    /// **Recovery strategy:** Release roots, wait for finalization, retry
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Object handle does not name a live object
    ///
    /// **When returned:** The object was reclaimed and its slot reused, or the
    /// handle was created by a different heap.
    #[error("Invalid object handle: {id}")]
    InvalidObject { id: ObjectId },

    /// Bounds check failed
    ///
    /// **When returned:** Field index >= the object's field count
    #[error("Bounds check failed: index {index} out of bounds for length {length}")]
    BoundsCheckFailed { index: usize, length: usize },

    /// Configuration error
    ///
    /// **When returned:** Invalid runtime configuration detected
    ///
    /// **Recovery strategy:** Use default configuration or fail fast
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid state
    ///
    /// **When returned:** Runtime lifecycle violation, e.g. starting twice
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Thread is not attached to this runtime
    #[error("Thread not found: {0}")]
    ThreadNotFound(ThreadId),

    /// The current OS thread is already attached to a runtime
    #[error("Current thread is already attached as {0}")]
    ThreadAlreadyAttached(ThreadId),

    /// Finalizer thread could not be spawned
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),

    /// Blocking wait was interrupted
    ///
    /// **When returned:** `ReferenceQueue::remove` while the waiting thread
    /// is interrupted. The interrupt status is cleared.
    ///
    /// **Recovery strategy:** Caller decides; the wait is not retried
    #[error("Wait interrupted")]
    Interrupted,

    /// Operation timeout
    ///
    /// **When returned:** Threads failed to reach a safepoint within
    /// `safepoint_timeout_ms`, or the finalizer thread did not exit in time.
    ///
    /// **Recovery strategy:** Retry with longer timeout or fail
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Agent invoked an operation without declaring the capability
    #[error("Missing capability: {0}")]
    MissingCapability(&'static str),

    /// Runtime has been stopped
    #[error("Runtime has been shut down")]
    ShutDown,

    /// Internal error - indicates a bug in HGC
    ///
    /// **Action required:** Report to developers with full stack trace
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HgcError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HgcError::OutOfMemory { .. } | HgcError::Timeout(_) | HgcError::Interrupted
        )
    }

    /// Check if this error indicates a bug in the code
    pub fn is_bug(&self) -> bool {
        matches!(self, HgcError::Internal(_))
    }
}

/// Result type alias for HGC operations
pub type Result<T> = std::result::Result<T, HgcError>;
