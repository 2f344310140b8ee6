//! GC Concurrency Tests - Mutators, Collections and Suspensions Racing
//!
//! These tests run several attached mutators doing random work while
//! collections, suspensions and queue consumers run alongside, then check:
//! - Rooted objects and their fields are never reclaimed
//! - Each finalizer runs at most once
//! - Each reference is delivered at most once
//! - Nothing deadlocks
//!
//! ============================================================================
//! EACH TEST FINDS SPECIFIC RACE CONDITIONS - DO NOT WEAKEN ASSERTIONS
//! ============================================================================

mod common;

use common::{assert_completed_within_timeout, RuntimeFixture, TEST_TIMEOUT};
use hgc::{ObjectBuilder, ObjectId, Reference, ReferenceQueue, Root, ThreadId};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const MUTATORS: usize = 4;
const OPERATIONS_PER_MUTATOR: usize = 2_000;
const MAX_LIVE_PER_MUTATOR: usize = 64;

/// Shared bookkeeping for invariant checks
#[derive(Default)]
struct Ledger {
    finalized: Mutex<HashSet<ObjectId>>,
    double_finalized: AtomicUsize,
    references_created: AtomicUsize,
}

fn finalizable(size: usize, ledger: &Arc<Ledger>) -> ObjectBuilder {
    let ledger = Arc::clone(ledger);
    ObjectBuilder::new(size).fields(2).finalizer(move |this| {
        if !ledger.finalized.lock().insert(this.id()) {
            ledger.double_finalized.fetch_add(1, Ordering::SeqCst);
        }
    })
}

fn mutator_loop(
    fixture_runtime: &hgc::Runtime,
    seed: u64,
    queue: &ReferenceQueue,
    ledger: &Arc<Ledger>,
) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let heap = Arc::clone(fixture_runtime.heap());
    let mut live: Vec<Root> = Vec::new();
    let mut references: Vec<Reference> = Vec::new();
    let mut checks = 0;

    for _ in 0..OPERATIONS_PER_MUTATOR {
        match rng.gen_range(0..100) {
            0..=39 => {
                let size = rng.gen_range(16..256);
                let builder = if rng.gen_bool(0.2) {
                    finalizable(size, ledger)
                } else {
                    ObjectBuilder::new(size).fields(2)
                };
                let object = fixture_runtime.allocate(builder).unwrap();
                if live.len() >= MAX_LIVE_PER_MUTATOR {
                    let victim = rng.gen_range(0..live.len());
                    live.swap_remove(victim);
                }
                live.push(object);
            },
            40..=59 if live.len() >= 2 => {
                let parent = &live[rng.gen_range(0..live.len())];
                let child = &live[rng.gen_range(0..live.len())];
                heap.set_field(parent, rng.gen_range(0..2), Some(child)).unwrap();
            },
            60..=74 if !live.is_empty() => {
                // Rooted objects and everything they point at are live
                let object = &live[rng.gen_range(0..live.len())];
                assert!(heap.is_live(object.id()), "rooted {} reclaimed", object.id());
                for index in 0..2 {
                    if let Some(child) = heap.get_field(object, index).unwrap() {
                        assert!(heap.is_live(child.id()), "field target {} reclaimed", child.id());
                    }
                }
                checks += 1;
            },
            75..=84 if !live.is_empty() => {
                let object = &live[rng.gen_range(0..live.len())];
                let reference = if rng.gen_bool(0.5) {
                    fixture_runtime.new_weak_reference(object, Some(queue))
                } else {
                    fixture_runtime.new_phantom_reference(object, queue)
                };
                references.push(reference.unwrap());
                ledger.references_created.fetch_add(1, Ordering::SeqCst);
                if references.len() > MAX_LIVE_PER_MUTATOR {
                    references.remove(0);
                }
            },
            85..=86 => {
                fixture_runtime.collect().unwrap();
            },
            _ => fixture_runtime.check_safepoint(),
        }
    }

    checks
}

/// Test random mutator work racing collections, suspensions and a queue
/// consumer
///
/// **Bug this finds:** Live objects swept during concurrent activity,
/// double finalization, double enqueue, deadlock between suspend and GC
/// **Invariant verified:** Safety properties hold under contention
#[test]
fn test_mutators_collections_and_suspensions() {
    let fixture = RuntimeFixture::with_defaults();
    let queue = ReferenceQueue::new();
    let ledger = Arc::new(Ledger::default());
    let ids: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(MUTATORS + 1));

    let mutators: Vec<_> = (0..MUTATORS)
        .map(|index| {
            let runtime = Arc::clone(&fixture.runtime);
            let queue = queue.clone();
            let ledger = Arc::clone(&ledger);
            let ids = Arc::clone(&ids);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mutator = runtime
                    .attach_current_thread(&format!("mutator-{}", index))
                    .unwrap();
                ids.lock().push(mutator.id());
                barrier.wait();
                mutator_loop(&runtime, 0xC0FFEE + index as u64, &queue, &ledger)
            })
        })
        .collect();

    // Consumer blocked in the queue most of the time
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let consumer = {
        let runtime = Arc::clone(&fixture.runtime);
        let queue = queue.clone();
        let done = Arc::clone(&done);
        let delivered = Arc::clone(&delivered);
        thread::spawn(move || {
            let _mutator = runtime.attach_current_thread("consumer").unwrap();
            while !done.load(Ordering::SeqCst) {
                if let Some(reference) = queue.remove_timeout(Duration::from_millis(5)).unwrap() {
                    delivered.lock().push(reference.id());
                }
            }
        })
    };

    barrier.wait();

    // Suspend and resume random mutators while they work
    let suspender = {
        let runtime = Arc::clone(&fixture.runtime);
        let ids = ids.lock().clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(7);
            let mut rounds = 0;
            while !done.load(Ordering::SeqCst) {
                let target = ids[rng.gen_range(0..ids.len())];
                if runtime.suspend_thread(target).is_ok() {
                    thread::sleep(Duration::from_micros(rng.gen_range(50..500)));
                    let _ = runtime.resume_thread(target);
                }
                rounds += 1;
                thread::sleep(Duration::from_micros(200));
            }
            rounds
        })
    };

    let checks: usize = assert_completed_within_timeout(
        || mutators.into_iter().map(|handle| handle.join().unwrap()).sum(),
        Duration::from_secs(60),
        "mutator threads",
    );
    done.store(true, Ordering::SeqCst);
    suspender.join().unwrap();
    consumer.join().unwrap();

    assert!(checks > 0);
    assert!(fixture.runtime.threads().is_empty(), "threads left attached");

    // Everything is unreachable now; two cycles finish finalization
    fixture.collect_and_finalize();
    fixture.collect_and_finalize();
    fixture.collect_and_finalize();
    assert!(fixture.runtime.run_finalization(TEST_TIMEOUT));

    assert_eq!(
        ledger.double_finalized.load(Ordering::SeqCst),
        0,
        "an object was finalized twice"
    );

    while let Some(reference) = queue.poll() {
        delivered.lock().push(reference.id());
    }
    let delivered = delivered.lock();
    let unique: HashSet<_> = delivered.iter().collect();
    assert_eq!(unique.len(), delivered.len(), "a reference was delivered twice");
    assert!(delivered.len() <= ledger.references_created.load(Ordering::SeqCst));
    assert_eq!(queue.total_enqueued(), delivered.len() as u64);
}

/// Test many threads collecting at once
///
/// **Bug this finds:** Overlapping collections, deadlock when two attached
/// threads both initiate a pause
/// **Invariant verified:** Collections serialize and all complete
#[test]
fn test_concurrent_collect_requests() {
    let fixture = RuntimeFixture::with_defaults();
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|index| {
            let runtime = Arc::clone(&fixture.runtime);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let _mutator = runtime
                    .attach_current_thread(&format!("collector-{}", index))
                    .unwrap();
                barrier.wait();
                for _ in 0..10 {
                    let _keep = runtime.allocate(ObjectBuilder::new(64)).unwrap();
                    runtime.collect().unwrap();
                }
            })
        })
        .collect();

    assert_completed_within_timeout(
        || {
            for handle in handles {
                handle.join().unwrap();
            }
        },
        Duration::from_secs(60),
        "concurrent collectors",
    );

    assert_eq!(fixture.runtime.gc().cycle_count(), (threads * 10) as u64);
    assert_eq!(fixture.runtime.stats().summary().total_cycles, (threads * 10) as u64);
}
