//! Reference Queue
//!
//! FIFO of cleared references, filled by the collector after each cycle
//! and drained by the program. `remove` blocks; a mutator blocked here is
//! in a blocking region and never holds up a stop-the-world pause.

use super::weak::Reference;
use crate::error::{HgcError, Result};
use crate::runtime::thread::{self, Interruptible};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct QueueShared {
    entries: Mutex<VecDeque<Reference>>,
    available: Condvar,
    total_enqueued: AtomicU64,
    total_removed: AtomicU64,
}

impl Interruptible for QueueShared {
    fn interrupt(&self) {
        // Taking the lock orders the wakeup after the waiter's flag check
        let _entries = self.entries.lock();
        self.available.notify_all();
    }
}

/// Queue of references cleared by the collector
///
/// Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct ReferenceQueue {
    shared: Arc<QueueShared>,
}

impl ReferenceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, reference: Reference) {
        let mut entries = self.shared.entries.lock();
        entries.push_back(reference);
        self.shared.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.available.notify_one();
    }

    /// Remove the oldest reference without waiting
    pub fn poll(&self) -> Option<Reference> {
        let reference = self.shared.entries.lock().pop_front()?;
        self.finish_removal(&reference);
        Some(reference)
    }

    /// Remove the oldest reference, waiting until one is available
    ///
    /// Returns [`HgcError::Interrupted`] if the calling mutator thread is
    /// interrupted while waiting; the interrupt flag is cleared.
    pub fn remove(&self) -> Result<Reference> {
        self.wait_for_entry(None)?
            .ok_or_else(|| HgcError::Internal("unbounded remove returned no entry".to_string()))
    }

    /// Like [`remove`](Self::remove) but gives up after `timeout`
    ///
    /// A zero timeout behaves like [`poll`](Self::poll).
    pub fn remove_timeout(&self, timeout: Duration) -> Result<Option<Reference>> {
        self.wait_for_entry(Some(Instant::now() + timeout))
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.lock().is_empty()
    }

    /// References ever delivered to this queue
    pub fn total_enqueued(&self) -> u64 {
        self.shared.total_enqueued.load(Ordering::Relaxed)
    }

    /// References ever taken from this queue
    pub fn total_removed(&self) -> u64 {
        self.shared.total_removed.load(Ordering::Relaxed)
    }

    fn wait_for_entry(&self, deadline: Option<Instant>) -> Result<Option<Reference>> {
        thread::blocking(|| {
            let signals = thread::current_signals();
            let blocker: Arc<dyn Interruptible> = self.shared.clone();
            let _parked = signals.as_ref().map(|s| s.park_on(blocker));

            let mut entries = self.shared.entries.lock();
            loop {
                if let Some(reference) = entries.pop_front() {
                    drop(entries);
                    self.finish_removal(&reference);
                    return Ok(Some(reference));
                }

                if signals.as_ref().is_some_and(|s| s.take_interrupt()) {
                    return Err(HgcError::Interrupted);
                }

                match deadline {
                    Some(deadline) => {
                        if Instant::now() >= deadline {
                            return Ok(None);
                        }
                        self.shared.available.wait_until(&mut entries, deadline);
                    },
                    None => self.shared.available.wait(&mut entries),
                }
            }
        })
    }

    fn finish_removal(&self, reference: &Reference) {
        reference.mark_removed();
        self.shared.total_removed.fetch_add(1, Ordering::Relaxed);
    }
}

impl PartialEq for ReferenceQueue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for ReferenceQueue {}

impl fmt::Debug for ReferenceQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceQueue")
            .field("len", &self.len())
            .field("total_enqueued", &self.total_enqueued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::heap::Heap;
    use crate::object::{ObjectBuilder, ReferenceKind, Root};

    fn weak_on(heap: &Arc<Heap>, queue: &ReferenceQueue) -> (Root, Reference) {
        let obj = heap
            .try_allocate(ObjectBuilder::new(8))
            .unwrap_or_else(|_| panic!("allocation should fit"));
        let weak = Reference::new(heap, ReferenceKind::Weak, &obj, Some(queue)).unwrap();
        (obj, weak)
    }

    #[test]
    fn test_poll_empty() {
        let queue = ReferenceQueue::new();
        assert!(queue.poll().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order() {
        let heap = Arc::new(Heap::new(&GcConfig::default()));
        let queue = ReferenceQueue::new();
        let (_a, first) = weak_on(&heap, &queue);
        let (_b, second) = weak_on(&heap, &queue);

        assert!(second.enqueue());
        assert!(first.enqueue());

        assert_eq!(queue.poll(), Some(second));
        assert_eq!(queue.poll(), Some(first));
        assert_eq!(queue.total_removed(), 2);
    }

    #[test]
    fn test_remove_timeout_expires() {
        let queue = ReferenceQueue::new();
        let start = Instant::now();
        let result = queue.remove_timeout(Duration::from_millis(20)).unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_remove_wakes_on_enqueue() {
        let heap = Arc::new(Heap::new(&GcConfig::default()));
        let queue = ReferenceQueue::new();
        let (_obj, weak) = weak_on(&heap, &queue);

        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.remove_timeout(Duration::from_secs(10)))
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(weak.enqueue());

        let removed = consumer.join().unwrap().unwrap();
        assert_eq!(removed, Some(weak));
    }
}
