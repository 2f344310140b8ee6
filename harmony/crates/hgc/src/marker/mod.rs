//! Marker Module - reachability tracing
//!
//! Depth-first tracing with an explicit worklist. Runs inside the
//! stop-the-world pause with the heap lock held, so mark bits are plain
//! header flags.

pub mod references;

pub(crate) use references::{ReferenceDiscovery, ReferenceProcessor, SoftRefPolicy};

use crate::heap::ObjectSpace;
use crate::object::ObjectId;

pub(crate) struct Marker {
    worklist: Vec<ObjectId>,
    marked_objects: usize,
    marked_bytes: usize,
}

impl Marker {
    pub(crate) fn new() -> Self {
        Self {
            worklist: Vec::new(),
            marked_objects: 0,
            marked_bytes: 0,
        }
    }

    /// Mark every object held by at least one root, then trace
    pub(crate) fn mark_roots(&mut self, space: &mut ObjectSpace) {
        let rooted: Vec<ObjectId> = space
            .ids()
            .filter(|id| space.get(*id).is_some_and(|record| record.roots > 0))
            .collect();

        for id in rooted {
            self.mark(space, id);
        }
        self.drain(space);
    }

    /// Mark `id` and everything reachable from it
    pub(crate) fn mark_from(&mut self, space: &mut ObjectSpace, id: ObjectId) {
        self.mark(space, id);
        self.drain(space);
    }

    fn mark(&mut self, space: &mut ObjectSpace, id: ObjectId) {
        if space.mark(id) {
            self.marked_objects += 1;
            self.marked_bytes += space.get(id).map_or(0, |record| record.header.size);
            self.worklist.push(id);
        }
    }

    fn drain(&mut self, space: &mut ObjectSpace) {
        while let Some(id) = self.worklist.pop() {
            let field_count = space.get(id).map_or(0, |record| record.fields.len());
            for index in 0..field_count {
                let child = space
                    .get(id)
                    .and_then(|record| record.fields.get(index).copied().flatten());
                if let Some(child) = child {
                    self.mark(space, child);
                }
            }
        }
    }

    pub(crate) fn marked_objects(&self) -> usize {
        self.marked_objects
    }

    /// Footprint of everything marked so far
    pub(crate) fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }
}
