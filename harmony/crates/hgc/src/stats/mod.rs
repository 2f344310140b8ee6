//! Stats Module - GC Performance Monitoring
//!
//! Metrics:
//! - Pause time and safepoint wait (min, max, mean, percentiles)
//! - Reclaimed objects and bytes
//! - References cleared and enqueued per kind
//! - Finalizers scheduled, completed, panicked and discarded

pub mod histogram;
pub mod timer;

pub use histogram::Histogram;
pub use timer::GcTimer;

use crate::gc::{CollectionReport, GcReason};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Statistics collector shared by the collector and the finalizer thread
pub struct GcStats {
    total_cycles: AtomicU64,
    emergency_cycles: AtomicU64,
    objects_reclaimed: AtomicU64,
    bytes_reclaimed: AtomicU64,
    soft_cleared: AtomicU64,
    weak_cleared: AtomicU64,
    phantom_cleared: AtomicU64,
    references_enqueued: AtomicU64,
    finalizers_scheduled: AtomicU64,
    finalizers_completed: AtomicU64,
    finalizers_panicked: AtomicU64,
    finalizers_discarded: AtomicU64,
    /// Pause time in nanoseconds
    pause_stats: Histogram,
    /// Time to reach the safepoint in nanoseconds
    safepoint_stats: Histogram,
    start_time: Instant,
}

impl GcStats {
    pub fn new() -> Self {
        Self {
            total_cycles: AtomicU64::new(0),
            emergency_cycles: AtomicU64::new(0),
            objects_reclaimed: AtomicU64::new(0),
            bytes_reclaimed: AtomicU64::new(0),
            soft_cleared: AtomicU64::new(0),
            weak_cleared: AtomicU64::new(0),
            phantom_cleared: AtomicU64::new(0),
            references_enqueued: AtomicU64::new(0),
            finalizers_scheduled: AtomicU64::new(0),
            finalizers_completed: AtomicU64::new(0),
            finalizers_panicked: AtomicU64::new(0),
            finalizers_discarded: AtomicU64::new(0),
            pause_stats: Histogram::new(),
            safepoint_stats: Histogram::new(),
            start_time: Instant::now(),
        }
    }

    /// Record a finished collection
    pub fn record_collection(&self, report: &CollectionReport) {
        self.total_cycles.fetch_add(1, Ordering::Relaxed);
        if matches!(report.reason, GcReason::Emergency { .. }) {
            self.emergency_cycles.fetch_add(1, Ordering::Relaxed);
        }

        add(&self.objects_reclaimed, report.reclaimed_objects);
        add(&self.bytes_reclaimed, report.reclaimed_bytes);
        add(&self.soft_cleared, report.soft_cleared);
        add(&self.weak_cleared, report.weak_cleared);
        add(&self.phantom_cleared, report.phantom_cleared);
        add(&self.references_enqueued, report.references_enqueued);

        self.pause_stats.record(report.pause.as_nanos() as u64);
        self.safepoint_stats
            .record(report.safepoint_wait.as_nanos() as u64);
    }

    pub(crate) fn record_finalizers_scheduled(&self, count: usize) {
        add(&self.finalizers_scheduled, count);
    }

    pub(crate) fn record_finalizer_completed(&self) {
        self.finalizers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finalizer_panicked(&self) {
        self.finalizers_panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_finalizers_discarded(&self, count: usize) {
        add(&self.finalizers_discarded, count);
    }

    pub fn pause_histogram(&self) -> &Histogram {
        &self.pause_stats
    }

    pub fn safepoint_histogram(&self) -> &Histogram {
        &self.safepoint_stats
    }

    /// Get summary statistics
    pub fn summary(&self) -> GcSummary {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        GcSummary {
            total_cycles: load(&self.total_cycles),
            emergency_cycles: load(&self.emergency_cycles),
            objects_reclaimed: load(&self.objects_reclaimed),
            bytes_reclaimed: load(&self.bytes_reclaimed),
            soft_cleared: load(&self.soft_cleared),
            weak_cleared: load(&self.weak_cleared),
            phantom_cleared: load(&self.phantom_cleared),
            references_enqueued: load(&self.references_enqueued),
            finalizers_scheduled: load(&self.finalizers_scheduled),
            finalizers_completed: load(&self.finalizers_completed),
            finalizers_panicked: load(&self.finalizers_panicked),
            finalizers_discarded: load(&self.finalizers_discarded),
            avg_pause_ms: self.pause_stats.mean() as f64 / 1_000_000.0,
            max_pause_ms: self.pause_stats.max() as f64 / 1_000_000.0,
            p99_pause_ms: self.pause_stats.p99() as f64 / 1_000_000.0,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Reset statistics
    pub fn reset(&self) {
        for counter in [
            &self.total_cycles,
            &self.emergency_cycles,
            &self.objects_reclaimed,
            &self.bytes_reclaimed,
            &self.soft_cleared,
            &self.weak_cleared,
            &self.phantom_cleared,
            &self.references_enqueued,
            &self.finalizers_scheduled,
            &self.finalizers_completed,
            &self.finalizers_panicked,
            &self.finalizers_discarded,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.pause_stats.clear();
        self.safepoint_stats.clear();
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

fn add(counter: &AtomicU64, value: usize) {
    counter.fetch_add(value as u64, Ordering::Relaxed);
}

/// Summary statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct GcSummary {
    pub total_cycles: u64,
    pub emergency_cycles: u64,
    pub objects_reclaimed: u64,
    pub bytes_reclaimed: u64,
    pub soft_cleared: u64,
    pub weak_cleared: u64,
    pub phantom_cleared: u64,
    pub references_enqueued: u64,
    pub finalizers_scheduled: u64,
    pub finalizers_completed: u64,
    pub finalizers_panicked: u64,
    pub finalizers_discarded: u64,
    /// Average pause time (ms)
    pub avg_pause_ms: f64,
    /// Max pause time (ms)
    pub max_pause_ms: f64,
    pub p99_pause_ms: f64,
    pub uptime_secs: u64,
}
