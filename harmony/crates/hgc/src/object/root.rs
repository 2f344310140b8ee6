//! Roots - strong handles held by Rust code
//!
//! A [`Root`] is the analogue of a stack slot or static field holding an
//! object: while any root to an object exists, the object is strongly
//! reachable. Cloning pins the object once more, dropping unpins it.

use super::header::{footprint, ObjectId};
use crate::heap::Heap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Finalizer closure
///
/// Receives a root to the object being finalized. Keeping a clone of that
/// root anywhere resurrects the object; it is never finalized again.
pub type FinalizerFn = Box<dyn FnOnce(&Root) + Send + 'static>;

/// Strong handle to a heap object
pub struct Root {
    heap: Arc<Heap>,
    id: ObjectId,
}

impl Root {
    /// Wrap an id whose root count was already incremented by the caller
    pub(crate) fn adopt(heap: Arc<Heap>, id: ObjectId) -> Self {
        Self { heap, id }
    }

    /// Object handle
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// True when both roots were handed out by the same heap
    pub(crate) fn belongs_to(&self, heap: &Heap) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.heap), heap)
    }
}

impl Clone for Root {
    fn clone(&self) -> Self {
        self.heap.lock().pin(self.id);
        Self {
            heap: Arc::clone(&self.heap),
            id: self.id,
        }
    }
}

impl Drop for Root {
    fn drop(&mut self) {
        self.heap.lock().unpin(self.id);
    }
}

impl PartialEq for Root {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.heap, &other.heap)
    }
}

impl Eq for Root {}

impl Hash for Root {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Root").field(&self.id).finish()
    }
}

/// Allocation request
///
/// # Examples
///
/// ```rust
/// use hgc::ObjectBuilder;
///
/// let builder = ObjectBuilder::new(64)
///     .fields(2)
///     .finalizer(|this| println!("finalizing {}", this.id()));
/// assert_eq!(builder.field_count(), 2);
/// ```
pub struct ObjectBuilder {
    size: usize,
    fields: usize,
    finalizer: Option<FinalizerFn>,
}

impl ObjectBuilder {
    /// Object with `size` payload bytes and no reference fields
    pub fn new(size: usize) -> Self {
        Self {
            size,
            fields: 0,
            finalizer: None,
        }
    }

    /// Number of reference fields, all initially null
    pub fn fields(mut self, count: usize) -> Self {
        self.fields = count;
        self
    }

    /// Attach a finalizer
    pub fn finalizer<F>(mut self, finalizer_fn: F) -> Self
    where
        F: FnOnce(&Root) + Send + 'static,
    {
        self.finalizer = Some(Box::new(finalizer_fn));
        self
    }

    /// Accounted heap footprint
    pub fn footprint(&self) -> usize {
        footprint(self.size, self.fields)
    }

    pub fn field_count(&self) -> usize {
        self.fields
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    pub(crate) fn into_parts(self) -> (usize, usize, Option<FinalizerFn>) {
        (self.footprint(), self.fields, self.finalizer)
    }
}

impl fmt::Debug for ObjectBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBuilder")
            .field("size", &self.size)
            .field("fields", &self.fields)
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}
