//! Configuration Module - Runtime Tuning Parameters
//!
//! Manages all configuration parameters for HGC: heap capacity, soft
//! reference clearing policy, finalizer thread behaviour and safepoint
//! deadlines.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the Harmony collector runtime
///
/// Most parameters have sensible defaults.
///
/// # Examples
///
/// ```rust
/// use hgc::GcConfig;
///
/// // Use default configuration
/// let config = GcConfig::default();
///
/// // Small heap that clears soft references early
/// let config = GcConfig {
///     heap_capacity: 4 * 1024 * 1024,
///     soft_ref_clear_threshold: 0.5,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Heap capacity in bytes
    ///
    /// Sum of object footprints may not exceed this value.
    /// Default: 64MB
    pub heap_capacity: usize,

    /// Heap utilization (0.0 - 1.0) at which soft references are cleared
    ///
    /// Measured after strong marking. Soft references are always cleared by
    /// an emergency collection regardless of this value.
    ///
    /// Default: 0.9
    pub soft_ref_clear_threshold: f32,

    /// Clear soft references not accessed for this many cycles
    ///
    /// 0 disables age based clearing.
    /// Default: 0
    pub soft_ref_lru_cycles: u64,

    /// Run finalizers
    ///
    /// When false, finalizers are discarded when their object is found
    /// unreachable and the object is reclaimed by the following cycle.
    ///
    /// Default: true
    pub finalizer_enabled: bool,

    /// Name of the finalizer thread
    ///
    /// Default: "hgc-finalizer"
    pub finalizer_thread_name: String,

    /// Run the finalizer thread at the lowest scheduling priority
    ///
    /// Best effort; only honoured on Linux.
    /// Default: true
    pub finalizer_low_priority: bool,

    /// Run still-pending finalizers when the runtime stops
    ///
    /// Default: false
    pub run_finalizers_on_exit: bool,

    /// How long `Runtime::stop` waits for the finalizer thread (ms)
    ///
    /// A finalizer that hangs past this deadline leaves the thread detached.
    /// Default: 5000
    pub shutdown_timeout_ms: u64,

    /// How long a collection waits for threads to reach a safepoint (ms)
    ///
    /// None waits forever.
    /// Default: None
    pub safepoint_timeout_ms: Option<u64>,

    /// Enable verbose console logging of GC events
    ///
    /// Default: false
    pub verbose: bool,

    /// Emit console events as JSON lines
    ///
    /// Default: false
    pub json_log: bool,

    /// Append GC events to this file
    ///
    /// Default: None
    pub log_file: Option<PathBuf>,

    /// Enable GC statistics collection
    ///
    /// Default: true
    pub stats_enabled: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            heap_capacity: 64 * MB,
            soft_ref_clear_threshold: 0.9,
            soft_ref_lru_cycles: 0,
            finalizer_enabled: true,
            finalizer_thread_name: "hgc-finalizer".to_string(),
            finalizer_low_priority: true,
            run_finalizers_on_exit: false,
            shutdown_timeout_ms: 5000,
            safepoint_timeout_ms: None,
            verbose: false,
            json_log: false,
            log_file: None,
            stats_enabled: true,
        }
    }
}

impl GcConfig {
    /// Validate configuration
    ///
    /// Checks if all values are in valid ranges.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use hgc::GcConfig;
    ///
    /// let config = GcConfig {
    ///     heap_capacity: 0,  // Invalid!
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heap_capacity < MIN_HEAP_CAPACITY {
            return Err(ConfigError::InvalidHeapCapacity(format!(
                "heap_capacity must be at least {} bytes",
                MIN_HEAP_CAPACITY
            )));
        }

        if !(0.0..=1.0).contains(&self.soft_ref_clear_threshold) {
            return Err(ConfigError::InvalidSoftRefThreshold(
                "soft_ref_clear_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.finalizer_thread_name.is_empty() || self.finalizer_thread_name.contains('\0') {
            return Err(ConfigError::InvalidThreadName(
                "finalizer_thread_name must be non-empty and contain no NUL".to_string(),
            ));
        }

        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "shutdown_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.safepoint_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidTimeout(
                "safepoint_timeout_ms must be > 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - HGC_HEAP_CAPACITY
    /// - HGC_SOFT_REF_THRESHOLD
    /// - HGC_FINALIZER_ENABLED
    /// - HGC_RUN_FINALIZERS_ON_EXIT
    /// - HGC_SAFEPOINT_TIMEOUT_MS
    /// - HGC_VERBOSE
    ///
    /// # Examples
    ///
    /// ```bash
    /// export HGC_HEAP_CAPACITY=268435456  # 256MB
    /// export HGC_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("HGC_HEAP_CAPACITY") {
            if let Ok(size) = val.parse::<usize>() {
                config.heap_capacity = size;
            }
        }

        if let Ok(val) = std::env::var("HGC_SOFT_REF_THRESHOLD") {
            if let Ok(threshold) = val.parse::<f32>() {
                config.soft_ref_clear_threshold = threshold;
            }
        }

        if let Ok(val) = std::env::var("HGC_FINALIZER_ENABLED") {
            config.finalizer_enabled = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("HGC_RUN_FINALIZERS_ON_EXIT") {
            config.run_finalizers_on_exit = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("HGC_SAFEPOINT_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.safepoint_timeout_ms = Some(ms);
            }
        }

        if let Ok(val) = std::env::var("HGC_VERBOSE") {
            config.verbose = parse_flag(&val);
        }

        config
    }

    /// Safepoint deadline as a `Duration`
    pub fn safepoint_timeout(&self) -> Option<std::time::Duration> {
        self.safepoint_timeout_ms
            .map(std::time::Duration::from_millis)
    }

    /// Finalizer shutdown deadline as a `Duration`
    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid heap capacity: {0}")]
    InvalidHeapCapacity(String),

    #[error("Invalid soft reference threshold: {0}")]
    InvalidSoftRefThreshold(String),

    #[error("Invalid thread name: {0}")]
    InvalidThreadName(String),

    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
}

// ============================================================================
// CONSTANTS & HELPERS
// ============================================================================

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

/// Smallest heap that can hold a handful of objects
pub const MIN_HEAP_CAPACITY: usize = 4 * KB;

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}
