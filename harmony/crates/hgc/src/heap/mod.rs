//! Heap Module - object storage and field access
//!
//! The heap owns every object record behind a single lock. Mutators reach
//! objects only through [`Root`]s; the collector takes the same lock for
//! the whole of its pause.

mod space;

pub(crate) use space::{ObjectRecord, ObjectSpace};

use crate::config::GcConfig;
use crate::error::{HgcError, Result};
use crate::object::{ObjectBuilder, ObjectHeader, ObjectId, Root};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Managed heap
pub struct Heap {
    space: Mutex<ObjectSpace>,
    /// Completed collection cycles, the time base for soft reference ageing
    clock: AtomicU64,
    total_allocated: AtomicU64,
}

impl Heap {
    pub fn new(config: &GcConfig) -> Self {
        Self {
            space: Mutex::new(ObjectSpace::new(config.heap_capacity)),
            clock: AtomicU64::new(0),
            total_allocated: AtomicU64::new(0),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ObjectSpace> {
        self.space.lock()
    }

    /// Allocate without collecting, handing the builder back on failure
    pub(crate) fn try_allocate(
        self: &Arc<Self>,
        builder: ObjectBuilder,
    ) -> std::result::Result<Root, ObjectBuilder> {
        let size = builder.footprint();
        let mut space = self.space.lock();
        if !space.can_fit(size) {
            return Err(builder);
        }

        let (size, fields, finalizer) = builder.into_parts();
        let id = space.insert(ObjectRecord {
            header: ObjectHeader::new(size, finalizer.is_some()),
            fields: vec![None; fields],
            finalizer,
            roots: 1,
        });
        drop(space);

        self.total_allocated.fetch_add(size as u64, Ordering::Relaxed);
        Ok(Root::adopt(Arc::clone(self), id))
    }

    /// Root an object found during a pause, without re-taking the lock
    pub(crate) fn root_locked(self: &Arc<Self>, space: &mut ObjectSpace, id: ObjectId) -> Option<Root> {
        if space.pin(id) {
            Some(Root::adopt(Arc::clone(self), id))
        } else {
            None
        }
    }

    /// Read reference field `index` of `object`
    pub fn get_field(self: &Arc<Self>, object: &Root, index: usize) -> Result<Option<Root>> {
        self.check_owner(object)?;
        let mut space = self.space.lock();
        let record = space
            .get(object.id())
            .ok_or(HgcError::InvalidObject { id: object.id() })?;
        let length = record.fields.len();
        let value = *record
            .fields
            .get(index)
            .ok_or(HgcError::BoundsCheckFailed { index, length })?;

        Ok(value.and_then(|id| self.root_locked(&mut space, id)))
    }

    /// Store `value` into reference field `index` of `object`
    pub fn set_field(&self, object: &Root, index: usize, value: Option<&Root>) -> Result<()> {
        self.check_owner(object)?;
        if let Some(value) = value {
            self.check_owner(value)?;
        }

        let mut space = self.space.lock();
        let record = space
            .get_mut(object.id())
            .ok_or(HgcError::InvalidObject { id: object.id() })?;
        let length = record.fields.len();
        let slot = record
            .fields
            .get_mut(index)
            .ok_or(HgcError::BoundsCheckFailed { index, length })?;
        *slot = value.map(Root::id);
        Ok(())
    }

    pub fn field_count(&self, object: &Root) -> Result<usize> {
        self.check_owner(object)?;
        self.space
            .lock()
            .get(object.id())
            .map(|record| record.fields.len())
            .ok_or(HgcError::InvalidObject { id: object.id() })
    }

    /// Accounted footprint of `object`
    pub fn size_of(&self, object: &Root) -> Result<usize> {
        self.check_owner(object)?;
        self.space
            .lock()
            .get(object.id())
            .map(|record| record.header.size)
            .ok_or(HgcError::InvalidObject { id: object.id() })
    }

    /// True until the collector reclaims `id`
    pub fn is_live(&self, id: ObjectId) -> bool {
        self.space.lock().contains(id)
    }

    /// True while a finalizer for `id` is scheduled but has not returned
    pub fn is_finalizer_pending(&self, id: ObjectId) -> bool {
        self.space
            .lock()
            .get(id)
            .is_some_and(|record| record.header.is_finalizer_pending())
    }

    pub(crate) fn finish_finalization(&self, id: ObjectId) {
        if let Some(record) = self.space.lock().get_mut(id) {
            record.header.finish_finalizer();
        }
    }

    // === Accounting ===

    pub fn capacity(&self) -> usize {
        self.space.lock().capacity()
    }

    pub fn used_bytes(&self) -> usize {
        self.space.lock().used_bytes()
    }

    pub fn available(&self) -> usize {
        self.space.lock().available()
    }

    pub fn object_count(&self) -> usize {
        self.space.lock().live_objects()
    }

    /// Fraction of capacity in use (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        let space = self.space.lock();
        space.used_bytes() as f64 / space.capacity() as f64
    }

    /// Reference registrations still tracked by the collector
    pub fn reference_count(&self) -> usize {
        self.space.lock().registered_references()
    }

    /// Bytes handed out since creation
    pub fn total_allocated(&self) -> u64 {
        self.total_allocated.load(Ordering::Relaxed)
    }

    pub(crate) fn clock(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    pub(crate) fn advance_clock(&self) {
        self.clock.fetch_add(1, Ordering::Relaxed);
    }

    fn check_owner(&self, root: &Root) -> Result<()> {
        if root.belongs_to(self) {
            Ok(())
        } else {
            Err(HgcError::InvalidObject { id: root.id() })
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let space = self.space.lock();
        f.debug_struct("Heap")
            .field("capacity", &space.capacity())
            .field("used_bytes", &space.used_bytes())
            .field("objects", &space.live_objects())
            .finish()
    }
}
