//! Object Header - Metadata for GC-managed objects
//!
//! Every object in the heap carries a small header next to its reference
//! fields:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Flags (1 byte)                  │
//! │  - Bit 0: Marked                        │
//! │  - Bit 1: Finalizable (finalizer unrun) │
//! │  - Bit 2: FinalizerPending (scheduled)  │
//! ├─────────────────────────────────────────┤
//! │         Size (8 bytes)                  │  <- footprint incl. header
//! └─────────────────────────────────────────┘
//! ```
//!
//! Headers are only mutated while the heap lock is held, so plain integers
//! are sufficient.

use serde::Serialize;
use std::fmt;

/// Accounted size of an object header in bytes
pub const HEADER_SIZE: usize = 16;

/// Accounted size of one reference field in bytes
pub const REFERENCE_SIZE: usize = 8;

/// Minimum object alignment (bytes)
pub const OBJECT_ALIGNMENT: usize = 8;

/// Flag bit positions
pub const MARKED_BIT: u8 = 0;
pub const FINALIZABLE_BIT: u8 = 1;
pub const FINALIZER_PENDING_BIT: u8 = 2;

/// Masks for flag fields
pub const MARKED_MASK: u8 = 1 << MARKED_BIT;
pub const FINALIZABLE_MASK: u8 = 1 << FINALIZABLE_BIT;
pub const FINALIZER_PENDING_MASK: u8 = 1 << FINALIZER_PENDING_BIT;

/// Handle naming one object slot
///
/// `generation` is bumped whenever the slot is freed, so a handle to a
/// reclaimed object never aliases its successor. Generations start at 1,
/// which keeps the packed form of every valid id non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        debug_assert!(generation != 0, "generation 0 is reserved for null");
        Self { index, generation }
    }

    /// Slot index
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a single word, 0 is never a valid id
    #[inline]
    pub(crate) fn pack(id: Option<ObjectId>) -> u64 {
        match id {
            Some(id) => ((id.generation as u64) << 32) | id.index as u64,
            None => 0,
        }
    }

    /// Inverse of [`ObjectId::pack`]
    #[inline]
    pub(crate) fn unpack(raw: u64) -> Option<ObjectId> {
        if raw == 0 {
            None
        } else {
            Some(ObjectId {
                index: raw as u32,
                generation: (raw >> 32) as u32,
            })
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}.{}", self.index, self.generation)
    }
}

/// Object Header
#[derive(Debug, Clone, Copy)]
pub struct ObjectHeader {
    flags: u8,
    /// Object footprint in bytes (including header and fields)
    pub size: usize,
}

impl ObjectHeader {
    /// Create new object header
    ///
    /// # Arguments
    /// * `size` - Total object footprint
    /// * `finalizable` - Object carries an unrun finalizer
    pub fn new(size: usize, finalizable: bool) -> Self {
        Self {
            flags: if finalizable { FINALIZABLE_MASK } else { 0 },
            size,
        }
    }

    // === Mark Bit Operations ===

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags & MARKED_MASK != 0
    }

    /// Set mark bit, returns true if it was already set
    #[inline]
    pub fn set_marked(&mut self) -> bool {
        let was = self.is_marked();
        self.flags |= MARKED_MASK;
        was
    }

    #[inline]
    pub fn clear_marked(&mut self) {
        self.flags &= !MARKED_MASK;
    }

    // === Finalization State ===

    /// Finalizer registered and not yet scheduled
    #[inline]
    pub fn is_finalizable(&self) -> bool {
        self.flags & FINALIZABLE_MASK != 0
    }

    /// Finalizer handed to the finalizer thread
    #[inline]
    pub fn is_finalizer_pending(&self) -> bool {
        self.flags & FINALIZER_PENDING_MASK != 0
    }

    /// Move from finalizable to pending. The finalizable bit is never set
    /// again, which is what keeps a resurrected object from being finalized
    /// twice.
    #[inline]
    pub fn schedule_finalizer(&mut self) {
        self.flags &= !FINALIZABLE_MASK;
        self.flags |= FINALIZER_PENDING_MASK;
    }

    /// Finalizer has returned
    #[inline]
    pub fn finish_finalizer(&mut self) {
        self.flags &= !FINALIZER_PENDING_MASK;
    }
}

/// Round `size` up to [`OBJECT_ALIGNMENT`]
#[inline]
pub fn align_up(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// Footprint of an object with `payload` bytes and `fields` references
pub fn footprint(payload: usize, fields: usize) -> usize {
    align_up(
        HEADER_SIZE
            .saturating_add(payload)
            .saturating_add(fields.saturating_mul(REFERENCE_SIZE)),
    )
}
