//! Mutator Threads
//!
//! A thread becomes a mutator by attaching to the runtime. Attached threads
//! must reach a safepoint before a collection can proceed; they do so by
//! polling, or by entering a blocking region around any wait that could
//! last an unbounded time.
//!
//! The attachment is recorded thread-locally so library code deep in a
//! call chain (a queue `remove`, a finalization wait) can mark the current
//! thread as blocked without threading a handle through every API.

use super::safepoint::SafepointManager;
use crate::error::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Identifier of an attached mutator thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Rebuild an id from [`as_raw`](Self::as_raw), e.g. across the C ABI
    pub const fn from_raw(raw: u64) -> Self {
        ThreadId(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// Thread scheduling status as seen by the safepoint protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreadStatus {
    /// Executing mutator code
    Running,
    /// Asked to stop, has not polled yet
    SafepointRequested,
    /// Parked at a safepoint
    Suspended,
    /// Inside a blocking region; counts as stopped
    Blocked,
}

/// Snapshot of one attached thread
#[derive(Debug, Clone, Serialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub status: ThreadStatus,
    pub suspend_count: u32,
    pub interrupted: bool,
}

/// Something a thread can be blocked on and woken from by an interrupt
pub(crate) trait Interruptible: Send + Sync {
    fn interrupt(&self);
}

/// Per-thread flags shared between the thread and the safepoint manager
pub(crate) struct ThreadSignals {
    /// Set when the thread must take the slow path at its next poll
    pub(crate) poll_requested: AtomicBool,
    interrupted: AtomicBool,
    blocker: Mutex<Option<Arc<dyn Interruptible>>>,
}

impl ThreadSignals {
    pub(crate) fn new() -> Self {
        Self {
            poll_requested: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            blocker: Mutex::new(None),
        }
    }

    /// Set the interrupt flag and wake whatever the thread is waiting on
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let blocker = self.blocker.lock().clone();
        if let Some(blocker) = blocker {
            blocker.interrupt();
        }
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Test and clear the interrupt flag
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Register `blocker` until the returned guard drops
    pub(crate) fn park_on(self: &Arc<Self>, blocker: Arc<dyn Interruptible>) -> BlockerGuard {
        *self.blocker.lock() = Some(blocker);
        BlockerGuard {
            signals: Arc::clone(self),
        }
    }
}

pub(crate) struct BlockerGuard {
    signals: Arc<ThreadSignals>,
}

impl Drop for BlockerGuard {
    fn drop(&mut self) {
        *self.signals.blocker.lock() = None;
    }
}

struct CurrentThread {
    manager: Weak<SafepointManager>,
    id: ThreadId,
    signals: Arc<ThreadSignals>,
    in_blocking_region: Cell<bool>,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentThread>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(manager: Weak<SafepointManager>, id: ThreadId, signals: Arc<ThreadSignals>) {
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(CurrentThread {
            manager,
            id,
            signals,
            in_blocking_region: Cell::new(false),
        });
    });
}

pub(crate) fn clear_current() {
    CURRENT.with(|current| current.borrow_mut().take());
}

/// Id of the calling thread if it is attached to any runtime
pub(crate) fn current_thread_id() -> Option<ThreadId> {
    CURRENT.with(|current| current.borrow().as_ref().map(|c| c.id))
}

/// Id of the calling thread if it is attached to `manager`
pub(crate) fn current_id_for(manager: &SafepointManager) -> Option<ThreadId> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|c| std::ptr::eq(c.manager.as_ptr(), manager))
            .map(|c| c.id)
    })
}

pub(crate) fn current_signals() -> Option<Arc<ThreadSignals>> {
    CURRENT.with(|current| current.borrow().as_ref().map(|c| Arc::clone(&c.signals)))
}

/// Safepoint poll for the calling thread, a no-op when unattached
pub(crate) fn poll_current(manager: &SafepointManager) {
    let pending = CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|c| std::ptr::eq(c.manager.as_ptr(), manager))
            .filter(|c| c.signals.poll_requested.load(Ordering::Acquire))
            .map(|c| c.id)
    });
    if let Some(id) = pending {
        manager.poll(id);
    }
}

/// Run `f` in a blocking region of the calling thread
///
/// While inside, the thread counts as stopped for the safepoint protocol.
/// On the way out it parks if a collection or suspension is in progress.
/// Nested regions collapse into the outermost one.
pub(crate) fn blocking<R>(f: impl FnOnce() -> R) -> R {
    blocking_region(true, f)
}

/// Like [`blocking`], but the exit parks only for a pause
///
/// A suspension requested meanwhile stays pending until the next poll, so
/// whatever `f` acquired can be released first.
pub(crate) fn blocking_deferring_suspend<R>(f: impl FnOnce() -> R) -> R {
    blocking_region(false, f)
}

fn blocking_region<R>(honor_suspend: bool, f: impl FnOnce() -> R) -> R {
    let entered = CURRENT.with(|current| {
        let current = current.borrow();
        let current = current.as_ref()?;
        if current.in_blocking_region.get() {
            return None;
        }
        let manager = current.manager.upgrade()?;
        current.in_blocking_region.set(true);
        Some((manager, current.id))
    });

    match entered {
        Some((manager, id)) => {
            manager.enter_blocking(id);
            let _region = BlockingRegion {
                manager,
                id,
                honor_suspend,
            };
            f()
        },
        None => f(),
    }
}

struct BlockingRegion {
    manager: Arc<SafepointManager>,
    id: ThreadId,
    honor_suspend: bool,
}

impl Drop for BlockingRegion {
    fn drop(&mut self) {
        self.manager.leave_blocking(self.id, self.honor_suspend);
        CURRENT.with(|current| {
            if let Some(current) = current.borrow().as_ref() {
                current.in_blocking_region.set(false);
            }
        });
    }
}

/// Attachment of the calling OS thread to a runtime
///
/// Dropping it detaches the thread. Not `Send`: the attachment belongs to
/// the thread that created it.
pub struct MutatorThread {
    manager: Arc<SafepointManager>,
    id: ThreadId,
    signals: Arc<ThreadSignals>,
    _not_send: PhantomData<*const ()>,
}

impl MutatorThread {
    pub(crate) fn new(manager: Arc<SafepointManager>, id: ThreadId, signals: Arc<ThreadSignals>) -> Self {
        Self {
            manager,
            id,
            signals,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Safepoint poll
    ///
    /// Cheap when nothing is requested. Parks the thread while a collection
    /// runs or while its suspend count is non-zero.
    #[inline]
    pub fn safepoint(&self) {
        if self.signals.poll_requested.load(Ordering::Acquire) {
            self.manager.poll(self.id);
        }
    }

    /// Run `f` in a blocking region
    ///
    /// Use around waits the runtime does not know about, such as I/O or a
    /// foreign lock.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        blocking(f)
    }

    /// Interrupt flag, left unchanged
    pub fn is_interrupted(&self) -> bool {
        self.signals.is_interrupted()
    }

    /// Test and clear the interrupt flag
    pub fn interrupted(&self) -> bool {
        self.signals.take_interrupt()
    }

    pub fn info(&self) -> Result<ThreadInfo> {
        self.manager.thread_info(self.id)
    }
}

impl Drop for MutatorThread {
    fn drop(&mut self) {
        self.manager.detach(self.id);
        clear_current();
    }
}

impl fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorThread").field("id", &self.id).finish()
    }
}
