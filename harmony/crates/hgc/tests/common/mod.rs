//! Test Utilities for the HGC Runtime Test Suite
//!
//! Fixtures own a started [`Runtime`] and stop it on drop. Helpers wait on
//! conditions with a deadline instead of sleeping a fixed amount, so a
//! missed wakeup shows up as a clear failure rather than a flaky pass.

use hgc::{GcConfig, ObjectBuilder, Root, Runtime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default heap size for tests (4MB)
pub const DEFAULT_HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// ============================================================================
/// RUNTIME FIXTURE
/// ============================================================================

/// Test fixture holding a started runtime
pub struct RuntimeFixture {
    pub runtime: Arc<Runtime>,
}

impl RuntimeFixture {
    /// Started runtime with a small heap and a bounded safepoint wait
    ///
    /// **Bug this finds:** Configuration validation bugs, finalizer thread
    /// failing to start
    pub fn with_defaults() -> Self {
        Self::with_config(test_config())
    }

    /// Started runtime with `config`
    pub fn with_config(config: GcConfig) -> Self {
        let runtime = Runtime::new(config).expect("runtime creation should succeed with valid config");
        runtime.start().expect("runtime should start");
        Self {
            runtime: Arc::new(runtime),
        }
    }

    /// Started runtime with a custom heap capacity
    pub fn with_heap_size(heap_capacity: usize) -> Self {
        Self::with_config(GcConfig {
            heap_capacity,
            ..test_config()
        })
    }

    /// Allocate and panic with context on failure
    #[track_caller]
    pub fn allocate(&self, builder: ObjectBuilder) -> Root {
        self.runtime
            .allocate(builder)
            .unwrap_or_else(|e| panic!("allocation failed: {:?}", e))
    }

    /// Allocate an object whose finalizer bumps `probe`
    #[track_caller]
    pub fn allocate_finalizable(&self, size: usize, probe: &FinalizerProbe) -> Root {
        let counter = Arc::clone(&probe.count);
        self.allocate(ObjectBuilder::new(size).finalizer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    /// Collect and panic with context on failure
    #[track_caller]
    pub fn collect(&self) -> hgc::CollectionReport {
        self.runtime
            .collect()
            .unwrap_or_else(|e| panic!("collection failed: {:?}", e))
    }

    /// Collect, then wait for the finalizers it scheduled
    #[track_caller]
    pub fn collect_and_finalize(&self) -> hgc::CollectionReport {
        let report = self.collect();
        assert!(
            self.runtime.run_finalization(TEST_TIMEOUT),
            "finalizers scheduled by cycle {} did not complete within {:?}",
            report.cycle,
            TEST_TIMEOUT
        );
        report
    }
}

impl Drop for RuntimeFixture {
    fn drop(&mut self) {
        let _ = self.runtime.stop();
    }
}

/// Config used by every fixture unless a test overrides it
pub fn test_config() -> GcConfig {
    GcConfig {
        heap_capacity: DEFAULT_HEAP_SIZE,
        safepoint_timeout_ms: Some(TEST_TIMEOUT.as_millis() as u64),
        shutdown_timeout_ms: 2_000,
        ..Default::default()
    }
}

/// ============================================================================
/// PROBES
/// ============================================================================

/// Counts finalizer invocations
#[derive(Clone, Default)]
pub struct FinalizerProbe {
    pub count: Arc<AtomicUsize>,
}

impl FinalizerProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// ============================================================================
/// WAIT AND ASSERTION HELPERS
/// ============================================================================

/// Poll `condition` until it holds or `timeout` passes
///
/// Returns whether the condition held.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Assert that `condition` becomes true within [`TEST_TIMEOUT`]
///
/// **Bug this finds:** Lost wakeups, threads never parking or resuming
#[track_caller]
pub fn assert_eventually(condition: impl FnMut() -> bool, context: &str) {
    assert!(
        wait_until(TEST_TIMEOUT, condition),
        "{}: condition not reached within {:?}",
        context,
        TEST_TIMEOUT
    );
}

/// Assert that an object is still in the heap
///
/// **Bug this finds:** Reachable or finalizer-pending objects reclaimed
#[track_caller]
pub fn assert_live(fixture: &RuntimeFixture, id: hgc::ObjectId, context: &str) {
    assert!(
        fixture.runtime.heap().is_live(id),
        "{}: {} was reclaimed while it must still be live",
        context,
        id
    );
}

/// Assert that an object has been reclaimed
///
/// **Bug this finds:** Garbage retained, leaked roots
#[track_caller]
pub fn assert_reclaimed(fixture: &RuntimeFixture, id: hgc::ObjectId, context: &str) {
    assert!(
        !fixture.runtime.heap().is_live(id),
        "{}: {} is still live, expected it to be reclaimed",
        context,
        id
    );
}

/// Assert that an operation finished within `timeout`
///
/// **Bug this finds:** Deadlock, safepoint never reached
#[track_caller]
pub fn assert_completed_within_timeout<F, R>(operation: F, timeout: Duration, context: &str) -> R
where
    F: FnOnce() -> R,
{
    let start = Instant::now();
    let result = operation();
    let elapsed = start.elapsed();

    assert!(
        elapsed < timeout,
        "{}: operation took {:?}, exceeded {:?} - possible deadlock",
        context,
        elapsed,
        timeout
    );

    result
}
