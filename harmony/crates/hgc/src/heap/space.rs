//! Object Space - slab of object records
//!
//! Slots are reused through a free list. Each reuse bumps the slot
//! generation so stale [`ObjectId`]s never resolve to a new object.

use crate::object::weak::ReferenceInner;
use crate::object::{FinalizerFn, ObjectHeader, ObjectId, Reference, ReferenceState};
use std::sync::Weak;

/// One live object
pub(crate) struct ObjectRecord {
    pub header: ObjectHeader,
    pub fields: Vec<Option<ObjectId>>,
    pub finalizer: Option<FinalizerFn>,
    /// Outstanding `Root` handles
    pub roots: usize,
}

struct Slot {
    generation: u32,
    record: Option<ObjectRecord>,
}

/// Result of a sweep
///
/// The records are dropped by the caller after the heap lock is released,
/// since a record may own a finalizer closure that owns roots.
pub(crate) struct SweepResult {
    pub garbage: Vec<ObjectRecord>,
    pub reclaimed_bytes: usize,
}

pub(crate) struct ObjectSpace {
    slots: Vec<Slot>,
    free: Vec<u32>,
    used_bytes: usize,
    live_objects: usize,
    capacity: usize,
    references: Vec<Weak<ReferenceInner>>,
}

impl ObjectSpace {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            used_bytes: 0,
            live_objects: 0,
            capacity,
            references: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.used_bytes)
    }

    pub fn live_objects(&self) -> usize {
        self.live_objects
    }

    pub fn can_fit(&self, size: usize) -> bool {
        size <= self.available()
    }

    /// Store a record, caller has checked [`can_fit`](Self::can_fit)
    pub(crate) fn insert(&mut self, record: ObjectRecord) -> ObjectId {
        self.used_bytes += record.header.size;
        self.live_objects += 1;

        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.record = Some(record);
                ObjectId::new(index, slot.generation)
            },
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 1,
                    record: Some(record),
                });
                ObjectId::new(index, 1)
            },
        }
    }

    pub(crate) fn get(&self, id: ObjectId) -> Option<&ObjectRecord> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.record.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Option<&mut ObjectRecord> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.record.as_mut())
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Add a root to a live object, false if `id` is stale
    pub(crate) fn pin(&mut self, id: ObjectId) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                record.roots += 1;
                true
            },
            None => false,
        }
    }

    pub(crate) fn unpin(&mut self, id: ObjectId) {
        if let Some(record) = self.get_mut(id) {
            debug_assert!(record.roots > 0, "unbalanced unpin of {}", id);
            record.roots = record.roots.saturating_sub(1);
        }
    }

    /// Live object ids in slot order
    pub(crate) fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record
                .as_ref()
                .map(|_| ObjectId::new(index as u32, slot.generation))
        })
    }

    // === Marking ===

    /// Set the mark bit, returns true if the object was live and unmarked
    pub(crate) fn mark(&mut self, id: ObjectId) -> bool {
        match self.get_mut(id) {
            Some(record) => !record.header.set_marked(),
            None => false,
        }
    }

    pub(crate) fn is_marked(&self, id: ObjectId) -> bool {
        self.get(id).is_some_and(|record| record.header.is_marked())
    }

    // === References ===

    pub(crate) fn register_reference(&mut self, reference: Weak<ReferenceInner>) {
        self.references.push(reference);
    }

    pub fn registered_references(&self) -> usize {
        self.references.len()
    }

    /// References the collector still has to consider
    ///
    /// Drops registrations whose handle is gone or that were cleared,
    /// enqueued or removed; those are never discovered again.
    pub(crate) fn active_references(&mut self) -> Vec<Reference> {
        let mut active = Vec::with_capacity(self.references.len());
        self.references.retain(|weak| {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            let reference = Reference::from_inner(inner);
            if reference.state() != ReferenceState::Active || reference.referent().is_none() {
                return false;
            }
            active.push(reference);
            true
        });
        active
    }

    // === Sweeping ===

    /// Free every unmarked object and clear the mark on survivors
    pub(crate) fn sweep(&mut self) -> SweepResult {
        let mut garbage = Vec::new();
        let mut reclaimed_bytes = 0;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(record) = slot.record.as_mut() else {
                continue;
            };

            if record.header.is_marked() {
                record.header.clear_marked();
                continue;
            }

            if let Some(record) = slot.record.take() {
                reclaimed_bytes += record.header.size;
                garbage.push(record);
                slot.generation = next_generation(slot.generation);
                self.free.push(index as u32);
            }
        }

        self.used_bytes -= reclaimed_bytes;
        self.live_objects -= garbage.len();

        SweepResult {
            garbage,
            reclaimed_bytes,
        }
    }
}

fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}
