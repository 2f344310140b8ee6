//! GC Logging and Tracing
//!
//! Structured events for collection cycles, reference processing,
//! finalization and thread suspension. Every event is forwarded to the
//! `log` facade; in addition the logger can echo events to the console
//! (human or JSON lines), append them to a file and keep a bounded
//! in-memory history for inspection.
//!
//! Log Levels:
//! - ERROR: allocation failures
//! - WARN: finalizer panics
//! - INFO: GC cycles, heap statistics
//! - DEBUG: reference processing, finalizer scheduling, suspension
//! - TRACE: safepoint timings

use crate::config::GcConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Log level for GC operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn to_log(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// GC event types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GcEvent {
    /// GC cycle started
    CycleStart { cycle: u64, reason: String },

    /// All mutators stopped
    SafepointReached {
        cycle: u64,
        threads: usize,
        wait_us: u64,
    },

    /// GC cycle completed
    CycleEnd {
        cycle: u64,
        duration_ms: f64,
        reclaimed_objects: usize,
        reclaimed_bytes: usize,
    },

    /// Heap statistics
    HeapStats {
        used_bytes: usize,
        capacity_bytes: usize,
        utilization: f64,
    },

    /// Allocation could not be satisfied without collecting
    AllocationFailure { size: usize, heap_used: usize },

    /// Reference processing statistics
    ReferenceStats {
        cycle: u64,
        soft_cleared: usize,
        weak_cleared: usize,
        phantom_cleared: usize,
        enqueued: usize,
    },

    /// Finalizers handed to the finalizer thread
    FinalizersScheduled { cycle: u64, count: usize },

    /// A finalizer panicked; the panic was swallowed
    FinalizerPanicked { object: String, message: String },

    /// Suspend count of a thread went up
    ThreadSuspended { thread: String, suspend_count: u32 },

    /// Suspend count of a thread went down
    ThreadResumed { thread: String, suspend_count: u32 },
}

impl GcEvent {
    /// Level the event is reported at
    pub fn level(&self) -> LogLevel {
        match self {
            GcEvent::AllocationFailure { .. } => LogLevel::Error,
            GcEvent::FinalizerPanicked { .. } => LogLevel::Warn,
            GcEvent::CycleStart { .. } | GcEvent::CycleEnd { .. } | GcEvent::HeapStats { .. } => {
                LogLevel::Info
            },
            GcEvent::ReferenceStats { .. }
            | GcEvent::FinalizersScheduled { .. }
            | GcEvent::ThreadSuspended { .. }
            | GcEvent::ThreadResumed { .. } => LogLevel::Debug,
            GcEvent::SafepointReached { .. } => LogLevel::Trace,
        }
    }

    /// One-line human readable form
    pub fn describe(&self) -> String {
        match self {
            GcEvent::CycleStart { cycle, reason } => {
                format!("[GC] Cycle {} started (reason: {})", cycle, reason)
            },
            GcEvent::SafepointReached {
                cycle,
                threads,
                wait_us,
            } => format!(
                "[GC] Cycle {}: {} threads at safepoint after {} us",
                cycle, threads, wait_us
            ),
            GcEvent::CycleEnd {
                cycle,
                duration_ms,
                reclaimed_objects,
                reclaimed_bytes,
            } => format!(
                "[GC] Cycle {} completed ({:.2}ms, reclaimed {} objects / {} bytes)",
                cycle, duration_ms, reclaimed_objects, reclaimed_bytes
            ),
            GcEvent::HeapStats {
                used_bytes,
                capacity_bytes,
                utilization,
            } => format!(
                "[GC] Heap: {}/{} bytes ({:.1}% utilized)",
                used_bytes,
                capacity_bytes,
                utilization * 100.0
            ),
            GcEvent::AllocationFailure { size, heap_used } => format!(
                "[GC] Allocation failure: {} bytes (heap used: {})",
                size, heap_used
            ),
            GcEvent::ReferenceStats {
                cycle,
                soft_cleared,
                weak_cleared,
                phantom_cleared,
                enqueued,
            } => format!(
                "[GC] Cycle {}: references cleared {} soft, {} weak, {} phantom; {} enqueued",
                cycle, soft_cleared, weak_cleared, phantom_cleared, enqueued
            ),
            GcEvent::FinalizersScheduled { cycle, count } => {
                format!("[GC] Cycle {}: {} finalizers scheduled", cycle, count)
            },
            GcEvent::FinalizerPanicked { object, message } => {
                format!("[GC] Finalizer for {} panicked: {}", object, message)
            },
            GcEvent::ThreadSuspended {
                thread,
                suspend_count,
            } => format!("[GC] {} suspended (count {})", thread, suspend_count),
            GcEvent::ThreadResumed {
                thread,
                suspend_count,
            } => format!("[GC] {} resumed (count {})", thread, suspend_count),
        }
    }
}

/// GC Logger configuration
#[derive(Debug, Clone)]
pub struct GcLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Enable console output
    pub console: bool,

    /// Append events to this file
    pub file: Option<PathBuf>,

    /// Enable JSON format
    pub json: bool,

    /// Enable timestamps
    pub timestamps: bool,

    /// Events kept in memory; oldest are dropped first
    pub history: usize,
}

impl Default for GcLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: false,
            file: None,
            json: false,
            timestamps: true,
            history: 4096,
        }
    }
}

impl GcLoggerConfig {
    /// Logger settings derived from the runtime configuration
    pub fn from_gc_config(config: &GcConfig) -> Self {
        Self {
            level: if config.verbose {
                LogLevel::Debug
            } else {
                LogLevel::Info
            },
            console: config.verbose,
            file: config.log_file.clone(),
            json: config.json_log,
            ..Default::default()
        }
    }
}

/// GC Logger - centralized logging for GC operations
pub struct GcLogger {
    config: GcLoggerConfig,
    events: Mutex<VecDeque<(Instant, GcEvent)>>,
    file: Mutex<Option<File>>,
    enabled: AtomicBool,
}

impl GcLogger {
    /// Create new GC logger
    ///
    /// A log file that cannot be opened is reported through `log` and
    /// otherwise ignored.
    pub fn new(config: GcLoggerConfig) -> Self {
        let file = config.file.as_ref().and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| log::warn!("cannot open GC log file {}: {}", path.display(), e))
                .ok()
        });

        Self {
            config,
            events: Mutex::new(VecDeque::new()),
            file: Mutex::new(file),
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable logging
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable logging
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Log a GC event
    pub fn log(&self, event: GcEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = event.level();
        log::log!(target: "hgc", level.to_log(), "{}", event.describe());

        if level > self.config.level {
            return;
        }

        if self.config.console || self.config.file.is_some() {
            let line = self.format_line(&event);
            if self.config.console {
                println!("{}", line);
            }
            self.write_file(&line);
        }

        let mut events = self.events.lock();
        if self.config.history > 0 && events.len() >= self.config.history {
            events.pop_front();
        }
        events.push_back((Instant::now(), event));
    }

    fn format_line(&self, event: &GcEvent) -> String {
        let body = if self.config.json {
            serde_json::to_string(event).unwrap_or_else(|_| event.describe())
        } else {
            event.describe()
        };

        if self.config.timestamps {
            let now = chrono::Local::now();
            format!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), body)
        } else {
            body
        }
    }

    fn write_file(&self, line: &str) {
        let mut file = self.file.lock();
        if let Some(handle) = file.as_mut() {
            if let Err(e) = writeln!(handle, "{}", line) {
                log::warn!("GC log file write failed, disabling file output: {}", e);
                *file = None;
            }
        }
    }

    /// Get all events
    pub fn get_events(&self) -> Vec<(Instant, GcEvent)> {
        self.events.lock().iter().cloned().collect()
    }

    /// Clear all events
    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Get event count
    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for GcLogger {
    fn default() -> Self {
        Self::new(GcLoggerConfig::default())
    }
}
