//! Safepoint Module - Thread coordination for GC and suspension
//!
//! Safepoints are points where a mutator thread can be stopped safely. A
//! thread is stopped when it is parked at a safepoint (`Suspended`) or
//! inside a blocking region (`Blocked`).
//!
//! Two independent requests can stop a thread:
//!
//! - **stop-the-world**: the collector asks every thread except itself to
//!   stop, and releases them all at the end of the pause.
//! - **suspend count**: an agent suspends a single thread. Suspensions nest;
//!   the thread runs again only once every suspend has been matched by a
//!   resume.
//!
//! Both live in one state record under one lock, so a thread released by
//! the collector while still suspended stays parked, and a thread resumed
//! during a pause stays parked until the pause ends.
//!
//! ## State Machine
//!
//! ```text
//!            request                 poll
//! RUNNING ──────────────▶ REQUESTED ──────▶ SUSPENDED
//!    ▲  │                                      │
//!    │  │ enter_blocking                       │ world released and
//!    │  ▼                                      │ suspend count == 0
//!    │ BLOCKED ──leave_blocking──▶ (parks if   │
//!    │                             requested)  │
//!    └─────────────────────────────────────────┘
//! ```

use super::thread::{self, MutatorThread, ThreadId, ThreadInfo, ThreadSignals, ThreadStatus};
use crate::error::{HgcError, Result};
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct ThreadEntry {
    name: String,
    status: ThreadStatus,
    suspend_count: u32,
    signals: Arc<ThreadSignals>,
}

impl ThreadEntry {
    fn request_stop(&mut self) {
        if self.status == ThreadStatus::Running {
            self.status = ThreadStatus::SafepointRequested;
            self.signals.poll_requested.store(true, Ordering::Release);
        }
    }

    fn withdraw_request(&mut self) {
        if self.status == ThreadStatus::SafepointRequested {
            self.status = ThreadStatus::Running;
        }
        self.signals.poll_requested.store(false, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        matches!(self.status, ThreadStatus::Suspended | ThreadStatus::Blocked)
    }
}

#[derive(Default)]
struct SafepointState {
    /// Attach order is kept for `threads()` listings
    threads: IndexMap<ThreadId, ThreadEntry, BuildHasherDefault<FxHasher>>,
    world_stopped: bool,
    initiator: Option<ThreadId>,
}

impl SafepointState {
    /// Whether `id` must stay parked right now
    fn must_park(&self, id: ThreadId) -> bool {
        match self.threads.get(&id) {
            Some(entry) => {
                entry.suspend_count > 0 || (self.world_stopped && self.initiator != Some(id))
            },
            None => false,
        }
    }

    /// Whether `id` is held only by a pause it did not initiate
    fn held_by_pause(&self, id: ThreadId) -> bool {
        self.world_stopped && self.initiator != Some(id) && self.threads.contains_key(&id)
    }

    fn all_stopped(&self) -> bool {
        self.threads
            .iter()
            .all(|(id, entry)| self.initiator == Some(*id) || entry.is_stopped())
    }

    fn pending_threads(&self) -> Vec<ThreadId> {
        self.threads
            .iter()
            .filter(|(id, entry)| self.initiator != Some(**id) && !entry.is_stopped())
            .map(|(id, _)| *id)
            .collect()
    }

    fn release_world(&mut self) {
        self.world_stopped = false;
        self.initiator = None;
        for entry in self.threads.values_mut() {
            if entry.suspend_count == 0 {
                entry.withdraw_request();
            }
        }
    }

    fn entry_mut(&mut self, id: ThreadId) -> Result<&mut ThreadEntry> {
        self.threads.get_mut(&id).ok_or(HgcError::ThreadNotFound(id))
    }
}

/// Coordinates safepoints, blocking regions and suspend counts
pub struct SafepointManager {
    state: Mutex<SafepointState>,
    changed: Condvar,
    next_thread_id: AtomicU64,
    timeout: Option<Duration>,
    safepoints_reached: AtomicU64,
}

impl SafepointManager {
    /// Create manager; `timeout` bounds how long a stop-the-world waits
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(SafepointState::default()),
            changed: Condvar::new(),
            next_thread_id: AtomicU64::new(1),
            timeout,
            safepoints_reached: AtomicU64::new(0),
        }
    }

    // === Attachment ===

    /// Attach the calling thread
    pub fn attach(self: &Arc<Self>, name: &str) -> Result<MutatorThread> {
        if let Some(existing) = thread::current_thread_id() {
            return Err(HgcError::ThreadAlreadyAttached(existing));
        }

        let id = ThreadId::from_raw(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let signals = Arc::new(ThreadSignals::new());

        {
            let mut state = self.state.lock();
            let mut entry = ThreadEntry {
                name: name.to_string(),
                status: ThreadStatus::Running,
                suspend_count: 0,
                signals: Arc::clone(&signals),
            };
            if state.world_stopped {
                entry.request_stop();
            }
            state.threads.insert(id, entry);
        }

        thread::set_current(Arc::downgrade(self), id, Arc::clone(&signals));
        let mutator = MutatorThread::new(Arc::clone(self), id, signals);

        // Joining during a pause parks until it ends
        mutator.safepoint();
        Ok(mutator)
    }

    pub(crate) fn detach(&self, id: ThreadId) {
        let mut state = self.state.lock();
        state.threads.shift_remove(&id);
        self.changed.notify_all();
    }

    // === Mutator side ===

    /// Slow path of a safepoint poll
    pub(crate) fn poll(&self, id: ThreadId) {
        let mut state = self.state.lock();
        if state.must_park(id) {
            self.park(&mut state, id, SafepointState::must_park);
        } else if let Some(entry) = state.threads.get_mut(&id) {
            entry.withdraw_request();
        }
    }

    pub(crate) fn enter_blocking(&self, id: ThreadId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.threads.get_mut(&id) {
            entry.status = ThreadStatus::Blocked;
            self.changed.notify_all();
        }
    }

    /// Leave a blocking region
    ///
    /// With `honor_suspend` unset the thread parks only for a pause; a
    /// pending suspension stays requested and takes effect at its next poll.
    pub(crate) fn leave_blocking(&self, id: ThreadId, honor_suspend: bool) {
        let mut state = self.state.lock();
        if honor_suspend && state.must_park(id) {
            self.park(&mut state, id, SafepointState::must_park);
        } else if !honor_suspend && state.held_by_pause(id) {
            self.park(&mut state, id, SafepointState::held_by_pause);
        } else if let Some(entry) = state.threads.get_mut(&id) {
            Self::resume_running(entry);
        }
    }

    fn park(
        &self,
        state: &mut MutexGuard<'_, SafepointState>,
        id: ThreadId,
        hold: fn(&SafepointState, ThreadId) -> bool,
    ) {
        if let Some(entry) = state.threads.get_mut(&id) {
            entry.status = ThreadStatus::Suspended;
        }
        self.safepoints_reached.fetch_add(1, Ordering::Relaxed);
        self.changed.notify_all();

        while hold(&**state, id) {
            self.changed.wait(state);
        }

        if let Some(entry) = state.threads.get_mut(&id) {
            Self::resume_running(entry);
        }
        self.changed.notify_all();
    }

    /// Back to running, keeping the poll flag up for a deferred suspension
    fn resume_running(entry: &mut ThreadEntry) {
        entry.status = ThreadStatus::Running;
        if entry.suspend_count > 0 {
            entry.request_stop();
        } else {
            entry.signals.poll_requested.store(false, Ordering::Release);
        }
    }

    // === Suspension ===

    /// Increment the suspend count of `target`, returns the new count
    ///
    /// The target stops at its next safepoint poll or blocking-region exit.
    /// When `target` is the calling thread the caller polls afterwards;
    /// see [`Runtime::suspend_thread`](crate::Runtime::suspend_thread).
    pub fn request_suspend(&self, target: ThreadId) -> Result<u32> {
        let mut state = self.state.lock();
        let entry = state.entry_mut(target)?;
        entry.suspend_count = entry.suspend_count.saturating_add(1);
        entry.request_stop();
        Ok(entry.suspend_count)
    }

    /// Decrement the suspend count of `target`
    ///
    /// Returns the new count, or `None` when the count was already zero and
    /// nothing changed. A thread reaching zero during a pause stays parked
    /// until the pause ends.
    pub fn resume(&self, target: ThreadId) -> Result<Option<u32>> {
        let mut state = self.state.lock();
        let held_by_gc = state.world_stopped && state.initiator != Some(target);
        let entry = state.entry_mut(target)?;
        if entry.suspend_count == 0 {
            return Ok(None);
        }

        entry.suspend_count -= 1;
        let count = entry.suspend_count;
        if count == 0 {
            if !held_by_gc {
                entry.withdraw_request();
            }
            self.changed.notify_all();
        }
        Ok(Some(count))
    }

    /// Set the interrupt flag of `target` and wake it if it is waiting
    pub fn interrupt(&self, target: ThreadId) -> Result<()> {
        let signals = {
            let mut state = self.state.lock();
            Arc::clone(&state.entry_mut(target)?.signals)
        };
        signals.interrupt();
        Ok(())
    }

    /// True once `target` has a non-zero suspend count and has stopped
    pub fn is_suspended(&self, target: ThreadId) -> Result<bool> {
        let mut state = self.state.lock();
        let entry = state.entry_mut(target)?;
        Ok(entry.suspend_count > 0 && entry.is_stopped())
    }

    /// Wait until `target` is suspended and stopped
    ///
    /// Returns false on timeout.
    pub fn wait_for_suspension(&self, target: ThreadId, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let entry = state.entry_mut(target)?;
            if entry.suspend_count > 0 && entry.is_stopped() {
                return Ok(true);
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                let entry = state.entry_mut(target)?;
                return Ok(entry.suspend_count > 0 && entry.is_stopped());
            }
        }
    }

    // === Stop-the-world ===

    /// Stop every attached thread other than `initiator`
    ///
    /// Returns once all of them are parked or blocked. The world restarts
    /// when the returned guard drops.
    pub fn stop_the_world(&self, initiator: Option<ThreadId>) -> Result<WorldStopped<'_>> {
        let mut state = self.state.lock();
        while state.world_stopped {
            self.changed.wait(&mut state);
        }

        state.world_stopped = true;
        state.initiator = initiator;
        for (id, entry) in state.threads.iter_mut() {
            if initiator != Some(*id) {
                entry.request_stop();
            }
        }

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        while !state.all_stopped() {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() && !state.all_stopped() {
                        let pending = state.pending_threads();
                        state.release_world();
                        self.changed.notify_all();
                        return Err(HgcError::Timeout(format!(
                            "threads {:?} did not reach a safepoint within {:?}",
                            pending,
                            self.timeout.unwrap_or_default()
                        )));
                    }
                },
                None => self.changed.wait(&mut state),
            }
        }

        Ok(WorldStopped {
            manager: self,
            threads_stopped: state
                .threads
                .len()
                .saturating_sub(usize::from(initiator.is_some())),
        })
    }

    fn release_world(&self) {
        let mut state = self.state.lock();
        state.release_world();
        self.changed.notify_all();
    }

    // === Introspection ===

    pub fn thread_info(&self, target: ThreadId) -> Result<ThreadInfo> {
        let state = self.state.lock();
        state
            .threads
            .get(&target)
            .map(|entry| snapshot(target, entry))
            .ok_or(HgcError::ThreadNotFound(target))
    }

    /// Snapshot of every attached thread in attach order
    pub fn threads(&self) -> Vec<ThreadInfo> {
        let state = self.state.lock();
        state
            .threads
            .iter()
            .map(|(id, entry)| snapshot(*id, entry))
            .collect()
    }

    pub fn thread_count(&self) -> usize {
        self.state.lock().threads.len()
    }

    pub fn is_world_stopped(&self) -> bool {
        self.state.lock().world_stopped
    }

    /// Number of times any thread parked at a safepoint
    pub fn safepoints_reached(&self) -> u64 {
        self.safepoints_reached.load(Ordering::Relaxed)
    }
}

impl Default for SafepointManager {
    fn default() -> Self {
        Self::new(None)
    }
}

fn snapshot(id: ThreadId, entry: &ThreadEntry) -> ThreadInfo {
    ThreadInfo {
        id,
        name: entry.name.clone(),
        status: entry.status,
        suspend_count: entry.suspend_count,
        interrupted: entry.signals.is_interrupted(),
    }
}

/// RAII guard for a stopped world
pub struct WorldStopped<'a> {
    manager: &'a SafepointManager,
    threads_stopped: usize,
}

impl WorldStopped<'_> {
    /// Number of threads held by this pause
    pub fn threads_stopped(&self) -> usize {
        self.threads_stopped
    }
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        self.manager.release_world();
    }
}
