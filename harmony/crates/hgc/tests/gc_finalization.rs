//! Finalization Tests - Finalizer Thread Behaviour
//!
//! These tests verify that finalizers:
//! - Run exactly once, on the finalizer thread
//! - See a live object and a live subgraph
//! - Can resurrect their object without being run again
//! - Cannot take the finalizer thread down by panicking
//!
//! ============================================================================
//! EACH TEST FINDS SPECIFIC FINALIZATION BUGS - DO NOT WEAKEN ASSERTIONS
//! ============================================================================

mod common;

use common::{
    assert_eventually, assert_live, assert_reclaimed, test_config, FinalizerProbe, RuntimeFixture,
    TEST_TIMEOUT,
};
use hgc::{
    AgentCapabilities, GcConfig, HgcError, NativeAgent, NativeEvent, ObjectBuilder, Root, Runtime,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

/// ============================================================================
/// EXACTLY ONCE
/// ============================================================================

/// Test that an unreachable finalizable object is finalized once
///
/// **Bug this finds:** Finalizer scheduled on every cycle, finalizable bit
/// not cleared
/// **Invariant verified:** A finalizer runs at most once per object
#[test]
fn test_finalizer_runs_exactly_once() {
    let fixture = RuntimeFixture::with_defaults();
    let probe = FinalizerProbe::new();

    let object = fixture.allocate_finalizable(64, &probe);
    let id = object.id();
    drop(object);

    let report = fixture.collect_and_finalize();
    assert_eq!(report.finalizers_scheduled, 1);
    assert_eq!(probe.count(), 1);

    // Second cycle reclaims it without finalizing again
    let report = fixture.collect_and_finalize();
    assert_eq!(report.finalizers_scheduled, 0);
    assert_eq!(probe.count(), 1, "finalizer ran twice");
    assert_reclaimed(&fixture, id, "finalized object after second cycle");

    fixture.collect_and_finalize();
    assert_eq!(probe.count(), 1);
}

/// Test that a reachable finalizable object is left alone
///
/// **Bug this finds:** Root scanning misses pinned objects
/// **Invariant verified:** Finalizers never run for reachable objects
#[test]
fn test_reachable_object_not_finalized() {
    let fixture = RuntimeFixture::with_defaults();
    let probe = FinalizerProbe::new();

    let object = fixture.allocate_finalizable(64, &probe);
    for _ in 0..3 {
        fixture.collect_and_finalize();
    }

    assert_eq!(probe.count(), 0);
    assert_live(&fixture, object.id(), "rooted finalizable object");
}

/// Test that finalizers run on the dedicated finalizer thread
///
/// **Bug this finds:** Finalizers run inline on the collecting mutator
/// **Invariant verified:** Every finalizer runs on the named finalizer thread
#[test]
fn test_finalizer_runs_on_finalizer_thread() {
    let fixture = RuntimeFixture::with_defaults();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..4 {
        let seen = Arc::clone(&seen);
        fixture.allocate(ObjectBuilder::new(16).finalizer(move |_| {
            let name = std::thread::current().name().map(str::to_string);
            seen.lock().push(name);
        }));
    }

    fixture.collect_and_finalize();

    let seen = seen.lock();
    assert_eq!(seen.len(), 4);
    assert!(
        seen.iter().all(|name| name.as_deref() == Some("hgc-finalizer")),
        "finalizers ran on {:?}",
        *seen
    );
}

/// ============================================================================
/// LIVENESS DURING FINALIZATION
/// ============================================================================

/// Test that an object and its subgraph stay live until its finalizer returns
///
/// **Bug this finds:** Finalizable objects swept in the cycle that schedules
/// them, fields pointing at freed slots
/// **Invariant verified:** Memory is reclaimed only after the finalizer ran
#[test]
fn test_object_live_until_finalizer_returns() {
    let fixture = RuntimeFixture::with_defaults();
    let heap = Arc::clone(fixture.runtime.heap());
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (child_tx, child_rx) = mpsc::channel();

    let release_rx = Mutex::new(release_rx);
    let parent = fixture.allocate(ObjectBuilder::new(32).fields(1).finalizer(move |this| {
        let child = heap.get_field(this, 0).ok().flatten();
        let _ = child_tx.send(child.as_ref().map(Root::id));
        let _ = release_rx.lock().recv();
    }));
    let child = fixture.allocate(ObjectBuilder::new(32));
    fixture
        .runtime
        .heap()
        .set_field(&parent, 0, Some(&child))
        .unwrap();

    let parent_id = parent.id();
    let child_id = child.id();
    drop(parent);
    drop(child);

    let report = fixture.collect();
    assert_eq!(report.finalizers_scheduled, 1);
    assert_eq!(report.reclaimed_objects, 0, "finalizer subgraph was swept");

    let seen_child = child_rx.recv_timeout(TEST_TIMEOUT).unwrap();
    assert_eq!(seen_child, Some(child_id), "finalizer saw a dangling field");

    // Finalizer still blocked: a cycle now must keep both alive
    assert!(fixture.runtime.heap().is_finalizer_pending(parent_id));
    fixture.collect();
    assert_live(&fixture, parent_id, "parent with running finalizer");
    assert_live(&fixture, child_id, "child of parent with running finalizer");

    release_tx.send(()).unwrap();
    assert!(fixture.runtime.run_finalization(TEST_TIMEOUT));
    assert!(!fixture.runtime.heap().is_finalizer_pending(parent_id));

    let report = fixture.collect();
    assert_eq!(report.reclaimed_objects, 2);
    assert_reclaimed(&fixture, parent_id, "parent after finalization");
    assert_reclaimed(&fixture, child_id, "child after finalization");
}

/// ============================================================================
/// RESURRECTION
/// ============================================================================

/// Test that a resurrected object survives and is not finalized again
///
/// **Bug this finds:** Resurrected object swept, finalizer re-armed
/// **Invariant verified:** Resurrection keeps the object; the finalizer
/// never runs a second time even after it becomes unreachable again
#[test]
fn test_resurrection_without_second_finalization() {
    let fixture = RuntimeFixture::with_defaults();
    let probe = FinalizerProbe::new();
    let stash: Arc<Mutex<Option<Root>>> = Arc::new(Mutex::new(None));

    let object = {
        let stash = Arc::clone(&stash);
        let counter = Arc::clone(&probe.count);
        fixture.allocate(ObjectBuilder::new(64).finalizer(move |this| {
            counter.fetch_add(1, Ordering::SeqCst);
            *stash.lock() = Some(this.clone());
        }))
    };
    let id = object.id();
    drop(object);

    fixture.collect_and_finalize();
    assert_eq!(probe.count(), 1);
    assert_eq!(stash.lock().as_ref().map(Root::id), Some(id));

    fixture.collect_and_finalize();
    assert_live(&fixture, id, "resurrected object");

    // Unreachable again
    stash.lock().take();
    let report = fixture.collect_and_finalize();
    assert_eq!(report.finalizers_scheduled, 0);
    assert_eq!(probe.count(), 1, "resurrected object finalized twice");
    assert_reclaimed(&fixture, id, "object after dropping the resurrection");
}

/// ============================================================================
/// PANICS
/// ============================================================================

struct PanicRecorder {
    events: Mutex<Vec<NativeEvent>>,
}

impl NativeAgent for PanicRecorder {
    fn name(&self) -> &str {
        "panic-recorder"
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities {
            gc_events: true,
            ..Default::default()
        }
    }

    fn on_event(&self, event: &NativeEvent) {
        if matches!(event, NativeEvent::FinalizerPanicked { .. }) {
            self.events.lock().push(event.clone());
        }
    }
}

/// Test that a panicking finalizer does not stop the next one
///
/// **Bug this finds:** Finalizer thread dies on panic, pending counter
/// never drained
/// **Invariant verified:** Panics are swallowed, reported, and the thread
/// keeps running
#[test]
fn test_panicking_finalizer_swallowed() {
    let fixture = RuntimeFixture::with_defaults();
    let recorder = Arc::new(PanicRecorder {
        events: Mutex::new(Vec::new()),
    });
    let _handle = fixture.runtime.register_agent(recorder.clone());

    let panicking = fixture.allocate(ObjectBuilder::new(16).finalizer(|_| panic!("boom")));
    let panicking_id = panicking.id();
    drop(panicking);

    let probe = FinalizerProbe::new();
    drop(fixture.allocate_finalizable(16, &probe));

    fixture.collect_and_finalize();
    assert_eq!(probe.count(), 1, "finalizer after a panicking one did not run");

    // Thread still serves later cycles
    drop(fixture.allocate_finalizable(16, &probe));
    fixture.collect_and_finalize();
    assert_eq!(probe.count(), 2);

    let summary = fixture.runtime.stats().summary();
    assert_eq!(summary.finalizers_panicked, 1);
    assert_eq!(summary.finalizers_completed, 2);

    let events = recorder.events.lock();
    assert_eq!(
        *events,
        vec![NativeEvent::FinalizerPanicked {
            object: panicking_id,
            message: "boom".to_string(),
        }]
    );
}

/// ============================================================================
/// CONFIGURATION AND SHUTDOWN
/// ============================================================================

/// Test that disabled finalization reclaims without running finalizers
///
/// **Bug this finds:** Objects leaked forever when no finalizer thread runs
/// **Invariant verified:** With finalization off, finalizable garbage is
/// reclaimed in the same cycle and no finalizer runs
#[test]
fn test_disabled_finalization_reclaims_immediately() {
    let fixture = RuntimeFixture::with_config(GcConfig {
        finalizer_enabled: false,
        ..test_config()
    });
    let probe = FinalizerProbe::new();

    let object = fixture.allocate_finalizable(64, &probe);
    let id = object.id();
    drop(object);

    let report = fixture.collect();
    assert_eq!(report.finalizers_scheduled, 0);
    assert_reclaimed(&fixture, id, "finalizable object with finalization off");
    assert!(fixture.runtime.run_finalization(TEST_TIMEOUT));
    assert_eq!(probe.count(), 0);
}

/// Test that pending finalizers run at exit when configured
///
/// **Bug this finds:** Shutdown drops queued finalizers
/// **Invariant verified:** `run_finalizers_on_exit` finalizes unreachable
/// objects during `stop`
#[test]
fn test_run_finalizers_on_exit() {
    let runtime = Runtime::new(GcConfig {
        run_finalizers_on_exit: true,
        ..test_config()
    })
    .unwrap();
    runtime.start().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = Arc::clone(&ran);
        drop(
            runtime
                .allocate(ObjectBuilder::new(32).finalizer(move |_| ran.store(true, Ordering::SeqCst)))
                .unwrap(),
        );
    }

    runtime.stop().unwrap();
    assert!(ran.load(Ordering::SeqCst), "finalizer skipped at exit");
}

/// Test that exit without the flag skips unscheduled finalizers
///
/// **Invariant verified:** No implicit collection at shutdown by default
#[test]
fn test_exit_without_flag_skips_finalizers() {
    let runtime = Runtime::new(test_config()).unwrap();
    runtime.start().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    {
        let count = Arc::clone(&count);
        drop(
            runtime
                .allocate(ObjectBuilder::new(32).finalizer(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap(),
        );
    }

    runtime.stop().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(matches!(runtime.collect(), Err(HgcError::ShutDown)));
}

/// Test that `run_finalization` waits for slow finalizers
///
/// **Bug this finds:** Pending counter decremented before the finalizer ran
/// **Invariant verified:** `run_finalization` returns only after completion
#[test]
fn test_run_finalization_waits_for_completion() {
    let fixture = RuntimeFixture::with_defaults();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..8 {
        let done = Arc::clone(&done);
        drop(fixture.allocate(ObjectBuilder::new(16).finalizer(move |_| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            done.fetch_add(1, Ordering::SeqCst);
        })));
    }

    fixture.collect();
    assert!(fixture.runtime.run_finalization(TEST_TIMEOUT));
    assert_eq!(done.load(Ordering::SeqCst), 8);
    assert_eq!(fixture.runtime.pending_finalizers(), 0);
    assert_eventually(
        || fixture.runtime.stats().summary().finalizers_completed == 8,
        "finalizer completions recorded",
    );
}
