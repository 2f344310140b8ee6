//! Garbage Collector - Main Coordinator
//!
//! Stop-the-world mark-sweep. A cycle:
//!
//! ```text
//! 1. Stop      - every attached mutator parks or is blocked
//! 2. Mark      - trace from roots
//! 3. Refs      - soft / weak / finalizable / phantom processing
//! 4. Sweep     - free unmarked objects
//! 5. Restart   - release the world
//! 6. Enqueue   - deliver cleared references, hand finalizers over
//! ```
//!
//! Steps 2-4 run with the heap lock held. Garbage records and cleared
//! references are dropped or delivered only after the world restarts, so
//! nothing user-visible runs inside the pause.

use crate::config::GcConfig;
use crate::error::{HgcError, Result};
use crate::heap::{Heap, ObjectRecord};
use crate::logging::{GcEvent, GcLogger};
use crate::marker::{Marker, ReferenceDiscovery, ReferenceProcessor, SoftRefPolicy};
use crate::object::{FinalizerFn, ObjectBuilder, Reference, Root};
use crate::runtime::finalizer::{FinalizeJob, Finalizer};
use crate::runtime::native::{NativeEvent, NativeInterface};
use crate::runtime::safepoint::SafepointManager;
use crate::runtime::thread;
use crate::stats::{GcStats, GcTimer};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Collector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GcState {
    Idle,
    /// Waiting for mutators to reach a safepoint
    Stopping,
    Marking,
    ProcessingReferences,
    Sweeping,
    /// World restarted, delivering references and finalizers
    Enqueuing,
}

/// Why a collection ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GcReason {
    /// Requested by the program
    Explicit,
    /// An allocation did not fit
    AllocationFailure { requested: usize },
    /// Last attempt before reporting out of memory; clears soft references
    Emergency { requested: usize },
    /// Final collection while the runtime stops
    Shutdown,
}

impl GcReason {
    pub fn is_emergency(&self) -> bool {
        matches!(self, GcReason::Emergency { .. })
    }
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcReason::Explicit => write!(f, "Explicit"),
            GcReason::AllocationFailure { requested } => {
                write!(f, "AllocationFailure({} bytes)", requested)
            },
            GcReason::Emergency { requested } => write!(f, "Emergency({} bytes)", requested),
            GcReason::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Result of one collection
#[derive(Debug, Clone, Serialize)]
pub struct CollectionReport {
    pub cycle: u64,
    pub reason: GcReason,
    pub threads_stopped: usize,
    pub marked_objects: usize,
    pub reclaimed_objects: usize,
    pub reclaimed_bytes: usize,
    pub soft_cleared: usize,
    pub weak_cleared: usize,
    pub phantom_cleared: usize,
    pub references_enqueued: usize,
    pub finalizers_scheduled: usize,
    /// Time until every mutator was stopped
    pub safepoint_wait: Duration,
    /// Stop-the-world duration
    pub pause: Duration,
}

/// Everything the pause produced that must be handled after restart
struct PauseOutcome {
    garbage: Vec<ObjectRecord>,
    discarded: Vec<FinalizerFn>,
    pending: Vec<Reference>,
    jobs: Vec<FinalizeJob>,
    report: CollectionReport,
}

/// GarbageCollector - main GC coordinator
pub struct GarbageCollector {
    config: Arc<GcConfig>,
    heap: Arc<Heap>,
    safepoints: Arc<SafepointManager>,
    finalizer: Arc<Finalizer>,
    native: Arc<NativeInterface>,
    logger: Arc<GcLogger>,
    stats: Arc<GcStats>,
    state: Mutex<GcState>,
    /// Serializes collections
    collect_lock: Mutex<()>,
    cycle_count: AtomicU64,
}

impl GarbageCollector {
    pub(crate) fn new(
        config: Arc<GcConfig>,
        heap: Arc<Heap>,
        safepoints: Arc<SafepointManager>,
        finalizer: Arc<Finalizer>,
        native: Arc<NativeInterface>,
        logger: Arc<GcLogger>,
        stats: Arc<GcStats>,
    ) -> Self {
        Self {
            config,
            heap,
            safepoints,
            finalizer,
            native,
            logger,
            stats,
            state: Mutex::new(GcState::Idle),
            collect_lock: Mutex::new(()),
            cycle_count: AtomicU64::new(0),
        }
    }

    /// Allocate, collecting when the heap is full
    ///
    /// Tries an ordinary collection first, then an emergency collection that
    /// clears every soft reference, before giving up with `OutOfMemory`.
    pub fn allocate(&self, builder: ObjectBuilder) -> Result<Root> {
        thread::poll_current(&self.safepoints);

        let requested = builder.footprint();
        if requested > self.heap.capacity() {
            return Err(HgcError::OutOfMemory {
                requested,
                available: self.heap.available(),
            });
        }

        let builder = match self.heap.try_allocate(builder) {
            Ok(root) => return Ok(root),
            Err(builder) => builder,
        };

        self.logger.log(GcEvent::AllocationFailure {
            size: requested,
            heap_used: self.heap.used_bytes(),
        });
        self.collect(GcReason::AllocationFailure { requested })?;
        let builder = match self.heap.try_allocate(builder) {
            Ok(root) => return Ok(root),
            Err(builder) => builder,
        };

        self.collect(GcReason::Emergency { requested })?;
        self.heap
            .try_allocate(builder)
            .map_err(|_| HgcError::OutOfMemory {
                requested,
                available: self.heap.available(),
            })
    }

    /// Run a full collection
    ///
    /// A caller that gets suspend-requested while waiting for another
    /// collection takes the suspension after its own collection finishes
    /// and the collect lock is released.
    pub fn collect(&self, reason: GcReason) -> Result<CollectionReport> {
        // Waiting for another collection counts as blocked, so that one can
        // stop this thread
        let serial = thread::blocking_deferring_suspend(|| self.collect_lock.lock());
        let result = self.collect_serialized(reason);
        drop(serial);

        thread::poll_current(&self.safepoints);
        result
    }

    fn collect_serialized(&self, reason: GcReason) -> Result<CollectionReport> {
        let cycle = self.cycle_count.load(Ordering::Relaxed) + 1;
        let initiator = thread::current_id_for(&self.safepoints);

        self.logger.log(GcEvent::CycleStart {
            cycle,
            reason: reason.to_string(),
        });
        self.native.dispatch(&NativeEvent::GcStarted { cycle });

        self.set_state(GcState::Stopping);
        let timer = GcTimer::new();
        let world = match self.safepoints.stop_the_world(initiator) {
            Ok(world) => world,
            Err(e) => {
                self.set_state(GcState::Idle);
                return Err(e);
            },
        };
        let safepoint_wait = timer.elapsed();
        self.logger.log(GcEvent::SafepointReached {
            cycle,
            threads: world.threads_stopped(),
            wait_us: safepoint_wait.as_micros() as u64,
        });

        let threads_stopped = world.threads_stopped();
        let outcome = self.pause(cycle, reason, threads_stopped, safepoint_wait);
        let pause = timer.elapsed();
        drop(world);

        let PauseOutcome {
            garbage,
            discarded,
            pending,
            jobs,
            mut report,
        } = outcome;
        drop(garbage);
        drop(discarded);

        self.set_state(GcState::Enqueuing);
        report.references_enqueued = pending
            .iter()
            .filter(|reference| reference.enqueue_pending())
            .count();
        report.finalizers_scheduled = self.finalizer.schedule(jobs);
        report.pause = pause;

        self.cycle_count.store(cycle, Ordering::Relaxed);
        self.finish_cycle(&report, timer.elapsed_ms());
        self.set_state(GcState::Idle);

        Ok(report)
    }

    /// Steps 2-4, with the heap lock held
    fn pause(
        &self,
        cycle: u64,
        reason: GcReason,
        threads_stopped: usize,
        safepoint_wait: Duration,
    ) -> PauseOutcome {
        let mut space = self.heap.lock();

        self.set_state(GcState::Marking);
        let mut marker = Marker::new();
        marker.mark_roots(&mut space);

        self.set_state(GcState::ProcessingReferences);
        let utilization = marker.marked_bytes() as f64 / space.capacity() as f64;
        let policy = SoftRefPolicy::new(
            &self.config,
            reason.is_emergency(),
            utilization,
            self.heap.clock(),
        );
        log::trace!(
            "cycle {}: strong utilization {:.3}, clear all soft references: {}",
            cycle,
            utilization,
            policy.clears_all()
        );
        let ReferenceDiscovery {
            pending,
            finalizable,
            discarded,
            soft_cleared,
            weak_cleared,
            phantom_cleared,
        } = ReferenceProcessor::new(policy, self.config.finalizer_enabled)
            .process(&mut space, &mut marker);

        let mut jobs = Vec::with_capacity(finalizable.len());
        let mut orphaned = Vec::new();
        for (id, finalizer) in finalizable {
            match self.heap.root_locked(&mut space, id) {
                Some(object) => jobs.push(FinalizeJob { object, finalizer }),
                None => orphaned.push(finalizer),
            }
        }
        let mut discarded = discarded;
        discarded.extend(orphaned);

        self.set_state(GcState::Sweeping);
        let sweep = space.sweep();
        self.heap.advance_clock();

        let report = CollectionReport {
            cycle,
            reason,
            threads_stopped,
            marked_objects: marker.marked_objects(),
            reclaimed_objects: sweep.garbage.len(),
            reclaimed_bytes: sweep.reclaimed_bytes,
            soft_cleared,
            weak_cleared,
            phantom_cleared,
            references_enqueued: 0,
            finalizers_scheduled: 0,
            safepoint_wait,
            pause: Duration::ZERO,
        };

        PauseOutcome {
            garbage: sweep.garbage,
            discarded,
            pending,
            jobs,
            report,
        }
    }

    fn finish_cycle(&self, report: &CollectionReport, duration_ms: f64) {
        if self.config.stats_enabled {
            self.stats.record_collection(report);
        }

        self.logger.log(GcEvent::ReferenceStats {
            cycle: report.cycle,
            soft_cleared: report.soft_cleared,
            weak_cleared: report.weak_cleared,
            phantom_cleared: report.phantom_cleared,
            enqueued: report.references_enqueued,
        });
        if report.finalizers_scheduled > 0 {
            self.logger.log(GcEvent::FinalizersScheduled {
                cycle: report.cycle,
                count: report.finalizers_scheduled,
            });
        }
        self.logger.log(GcEvent::CycleEnd {
            cycle: report.cycle,
            duration_ms,
            reclaimed_objects: report.reclaimed_objects,
            reclaimed_bytes: report.reclaimed_bytes,
        });
        self.logger.log(GcEvent::HeapStats {
            used_bytes: self.heap.used_bytes(),
            capacity_bytes: self.heap.capacity(),
            utilization: self.heap.utilization(),
        });

        self.native.dispatch(&NativeEvent::GcFinished {
            cycle: report.cycle,
            reclaimed_objects: report.reclaimed_objects,
            reclaimed_bytes: report.reclaimed_bytes,
        });
    }

    fn set_state(&self, state: GcState) {
        *self.state.lock() = state;
    }

    pub fn state(&self) -> GcState {
        *self.state.lock()
    }

    pub fn is_collecting(&self) -> bool {
        self.state() != GcState::Idle
    }

    /// Completed collections
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.load(Ordering::Relaxed)
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn stats(&self) -> &Arc<GcStats> {
        &self.stats
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::finalizer::FinalizerConfig;

    fn collector(config: GcConfig) -> GarbageCollector {
        let config = Arc::new(config);
        let stats = Arc::new(GcStats::new());
        let logger = Arc::new(GcLogger::default());
        let native = Arc::new(NativeInterface::new());
        let finalizer = Arc::new(Finalizer::new(
            FinalizerConfig::default(),
            Arc::clone(&stats),
            Arc::clone(&logger),
            Arc::clone(&native),
        ));
        GarbageCollector::new(
            Arc::clone(&config),
            Arc::new(Heap::new(&config)),
            Arc::new(SafepointManager::default()),
            finalizer,
            native,
            logger,
            stats,
        )
    }

    #[test]
    fn test_collect_reclaims_unrooted() {
        let gc = collector(GcConfig::default());
        let kept = gc.allocate(ObjectBuilder::new(32)).unwrap();
        let dropped = gc.allocate(ObjectBuilder::new(32)).unwrap();
        let dropped_id = dropped.id();
        drop(dropped);

        let report = gc.collect(GcReason::Explicit).unwrap();
        assert_eq!(report.cycle, 1);
        assert_eq!(report.reclaimed_objects, 1);
        assert_eq!(report.reclaimed_bytes, 48);
        assert!(gc.heap().is_live(kept.id()));
        assert!(!gc.heap().is_live(dropped_id));
        assert_eq!(gc.state(), GcState::Idle);
        assert_eq!(gc.cycle_count(), 1);
    }

    #[test]
    fn test_allocation_failure_triggers_collection() {
        let gc = collector(GcConfig {
            heap_capacity: 8 * 1024,
            ..Default::default()
        });
        for _ in 0..64 {
            gc.allocate(ObjectBuilder::new(1024)).unwrap();
        }
        assert!(gc.cycle_count() > 0);
    }

    #[test]
    fn test_oversized_allocation_fails_fast() {
        let gc = collector(GcConfig {
            heap_capacity: 8 * 1024,
            ..Default::default()
        });
        let result = gc.allocate(ObjectBuilder::new(16 * 1024));
        assert!(matches!(result, Err(HgcError::OutOfMemory { .. })));
        assert_eq!(gc.cycle_count(), 0);
    }

    #[test]
    fn test_stats_recorded() {
        let gc = collector(GcConfig::default());
        gc.collect(GcReason::Explicit).unwrap();
        gc.collect(GcReason::Emergency { requested: 0 }).unwrap();
        let summary = gc.stats().summary();
        assert_eq!(summary.total_cycles, 2);
        assert_eq!(summary.emergency_cycles, 1);
    }
}
