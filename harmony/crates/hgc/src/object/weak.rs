//! Soft, Weak and Phantom References
//!
//! References observe an object without keeping it strongly reachable.
//! When the collector finds the referent unreachable it clears the
//! reference and, after the world restarts, delivers it to its queue.
//!
//! ## Reference States
//!
//! ```text
//! ACTIVE ──(collector, inside pause)──▶ PENDING
//!    │                                     │
//!    │ enqueue()                           │ post-GC enqueue step
//!    ▼                                     ▼
//! ENQUEUED ◀──────────────────────────────┘
//!    │
//!    │ poll() / remove()
//!    ▼
//! INACTIVE   (also: PENDING with no queue)
//! ```
//!
//! Every transition is a compare-exchange on the state word, so a reference
//! reaches its queue at most once no matter how the collector and a manual
//! `enqueue()` interleave.
//!
//! The referent word is read and cleared only while the heap lock is held.
//! `get()` reads and pins under that same lock, so a mutator can never see
//! a cleared referent for an object it could still strongly reach.

use super::header::ObjectId;
use super::reference_queue::ReferenceQueue;
use super::root::Root;
use crate::error::{HgcError, Result};
use crate::heap::{Heap, ObjectSpace};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

static NEXT_REFERENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Reference strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReferenceKind {
    /// Cleared at the collector's discretion under memory pressure
    Soft,
    /// Cleared as soon as the referent is not strongly reachable
    Weak,
    /// Enqueued once the referent is unreachable and finalized; never
    /// yields its referent
    Phantom,
}

/// Reference lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ReferenceState {
    Active = 0,
    Pending = 1,
    Enqueued = 2,
    Inactive = 3,
}

impl ReferenceState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ReferenceState::Active,
            1 => ReferenceState::Pending,
            2 => ReferenceState::Enqueued,
            _ => ReferenceState::Inactive,
        }
    }
}

pub(crate) struct ReferenceInner {
    id: u64,
    kind: ReferenceKind,
    heap: Arc<Heap>,
    /// Packed `ObjectId`, 0 when cleared
    referent: AtomicU64,
    state: AtomicU8,
    queue: Option<ReferenceQueue>,
    /// Heap clock at last `get()`, drives soft reference ageing
    last_access: AtomicU64,
}

/// Handle to a soft, weak or phantom reference
///
/// Clones share identity: equality compares the underlying reference
/// object, so a reference returned from a queue compares equal to the one
/// the program created.
#[derive(Clone)]
pub struct Reference {
    inner: Arc<ReferenceInner>,
}

impl Reference {
    pub(crate) fn new(
        heap: &Arc<Heap>,
        kind: ReferenceKind,
        referent: &Root,
        queue: Option<&ReferenceQueue>,
    ) -> Result<Self> {
        if !referent.belongs_to(heap) {
            return Err(HgcError::InvalidObject { id: referent.id() });
        }

        let inner = Arc::new(ReferenceInner {
            id: NEXT_REFERENCE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            heap: Arc::clone(heap),
            referent: AtomicU64::new(ObjectId::pack(Some(referent.id()))),
            state: AtomicU8::new(ReferenceState::Active as u8),
            queue: queue.cloned(),
            last_access: AtomicU64::new(heap.clock()),
        });

        heap.lock().register_reference(Arc::downgrade(&inner));

        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ReferenceInner>) -> Self {
        Self { inner }
    }

    /// Unique reference id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> ReferenceKind {
        self.inner.kind
    }

    pub fn state(&self) -> ReferenceState {
        ReferenceState::from_raw(self.inner.state.load(Ordering::Acquire))
    }

    /// Queue this reference is registered with
    pub fn queue(&self) -> Option<&ReferenceQueue> {
        self.inner.queue.as_ref()
    }

    /// Strong root to the referent, or `None` once cleared
    ///
    /// Phantom references always return `None`.
    pub fn get(&self) -> Option<Root> {
        if self.inner.kind == ReferenceKind::Phantom {
            return None;
        }

        let heap = &self.inner.heap;
        let mut space = heap.lock();
        let id = self.load_referent()?;
        if !space.pin(id) {
            return None;
        }
        if self.inner.kind == ReferenceKind::Soft {
            self.inner.last_access.store(heap.clock(), Ordering::Relaxed);
        }
        drop(space);

        Some(Root::adopt(Arc::clone(heap), id))
    }

    /// True if the referent is `object`; works for phantom references
    pub fn refers_to(&self, object: &Root) -> bool {
        if !object.belongs_to(&self.inner.heap) {
            return false;
        }
        let _space = self.inner.heap.lock();
        self.load_referent() == Some(object.id())
    }

    /// Clear the referent without enqueueing
    pub fn clear(&self) {
        let _space = self.inner.heap.lock();
        self.inner.referent.store(0, Ordering::Release);
    }

    /// Clear the referent and add this reference to its queue
    ///
    /// Returns `false` when there is no queue or the reference was already
    /// enqueued or removed.
    pub fn enqueue(&self) -> bool {
        self.clear();

        let Some(queue) = self.inner.queue.as_ref() else {
            return false;
        };

        let claimed = self.transition(ReferenceState::Active, ReferenceState::Enqueued)
            || self.transition(ReferenceState::Pending, ReferenceState::Enqueued);
        if claimed {
            queue.push(self.clone());
        }
        claimed
    }

    /// True while the reference sits in its queue
    pub fn is_enqueued(&self) -> bool {
        self.state() == ReferenceState::Enqueued
    }

    // === Collector side ===

    pub(crate) fn referent(&self) -> Option<ObjectId> {
        self.load_referent()
    }

    pub(crate) fn last_access(&self) -> u64 {
        self.inner.last_access.load(Ordering::Relaxed)
    }

    /// ACTIVE -> PENDING, clearing the referent
    ///
    /// Caller holds the heap lock (proved by the `ObjectSpace` borrow).
    pub(crate) fn make_pending(&self, _space: &mut ObjectSpace) -> bool {
        if self.transition(ReferenceState::Active, ReferenceState::Pending) {
            self.inner.referent.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// PENDING -> ENQUEUED (or INACTIVE when there is no queue)
    ///
    /// Returns true if the reference was delivered to a queue.
    pub(crate) fn enqueue_pending(&self) -> bool {
        match self.inner.queue.as_ref() {
            Some(queue) => {
                if self.transition(ReferenceState::Pending, ReferenceState::Enqueued) {
                    queue.push(self.clone());
                    true
                } else {
                    false
                }
            },
            None => {
                self.transition(ReferenceState::Pending, ReferenceState::Inactive);
                false
            },
        }
    }

    /// ENQUEUED -> INACTIVE, called by the consumer
    pub(crate) fn mark_removed(&self) {
        self.transition(ReferenceState::Enqueued, ReferenceState::Inactive);
    }

    fn load_referent(&self) -> Option<ObjectId> {
        ObjectId::unpack(self.inner.referent.load(Ordering::Acquire))
    }

    fn transition(&self, from: ReferenceState, to: ReferenceState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Reference {}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .field("referent", &self.load_referent())
            .finish()
    }
}
