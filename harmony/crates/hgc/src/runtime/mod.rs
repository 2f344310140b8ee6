//! Runtime Module - GC Runtime Integration
//!
//! Ties the collector to the execution environment:
//! - Mutator thread attachment and safepoints
//! - Finalizer thread lifecycle
//! - Thread suspension and interruption
//! - Native agent registration

pub mod finalizer;
pub mod native;
pub mod safepoint;
pub mod thread;

pub use finalizer::{Finalizer, FinalizerConfig};
pub use native::{AgentCapabilities, AgentHandle, NativeAgent, NativeEvent, NativeInterface, NoopAgent};
pub use safepoint::{SafepointManager, WorldStopped};
pub use thread::{MutatorThread, ThreadId, ThreadInfo, ThreadStatus};

use crate::config::GcConfig;
use crate::error::{HgcError, Result};
use crate::gc::{CollectionReport, GarbageCollector, GcReason};
use crate::heap::Heap;
use crate::logging::{GcLogger, GcLoggerConfig};
use crate::object::{ObjectBuilder, Reference, ReferenceKind, ReferenceQueue, Root};
use crate::stats::GcStats;
use native::ThreadControl;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Runtime - GC runtime orchestrator
///
/// # Examples
///
/// ```rust
/// use hgc::{ObjectBuilder, ReferenceQueue, Runtime, GcConfig};
///
/// let runtime = Runtime::new(GcConfig::default()).unwrap();
/// runtime.start().unwrap();
///
/// let queue = ReferenceQueue::new();
/// let object = runtime.allocate(ObjectBuilder::new(32)).unwrap();
/// let phantom = runtime.new_phantom_reference(&object, &queue).unwrap();
///
/// drop(object);
/// runtime.collect().unwrap();
/// assert_eq!(queue.poll(), Some(phantom));
///
/// runtime.stop().unwrap();
/// ```
pub struct Runtime {
    gc: Arc<GarbageCollector>,
    heap: Arc<Heap>,
    finalizer: Arc<Finalizer>,
    control: ThreadControl,
    stats: Arc<GcStats>,
    config: Arc<GcConfig>,
    state: Mutex<RuntimeState>,
}

impl Runtime {
    /// Create new runtime
    pub fn new(config: GcConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| HgcError::Configuration(e.to_string()))?;
        let config = Arc::new(config);

        let logger = Arc::new(GcLogger::new(GcLoggerConfig::from_gc_config(&config)));
        let stats = Arc::new(GcStats::new());
        let native = Arc::new(NativeInterface::new());
        let safepoints = Arc::new(SafepointManager::new(config.safepoint_timeout()));
        let heap = Arc::new(Heap::new(&config));
        let finalizer = Arc::new(Finalizer::new(
            FinalizerConfig {
                thread_name: config.finalizer_thread_name.clone(),
                low_priority: config.finalizer_low_priority,
                enabled: config.finalizer_enabled,
            },
            Arc::clone(&stats),
            Arc::clone(&logger),
            Arc::clone(&native),
        ));
        let gc = Arc::new(GarbageCollector::new(
            Arc::clone(&config),
            Arc::clone(&heap),
            Arc::clone(&safepoints),
            Arc::clone(&finalizer),
            Arc::clone(&native),
            Arc::clone(&logger),
            Arc::clone(&stats),
        ));

        Ok(Self {
            gc,
            heap,
            finalizer,
            control: ThreadControl {
                safepoints,
                native,
                logger,
            },
            stats,
            config,
            state: Mutex::new(RuntimeState::Initialized),
        })
    }

    /// Start runtime, spawning the finalizer thread
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != RuntimeState::Initialized {
            return Err(HgcError::InvalidState {
                expected: format!("{:?}", RuntimeState::Initialized),
                actual: format!("{:?}", *state),
            });
        }

        if self.config.finalizer_enabled {
            self.finalizer.start()?;
        }
        *state = RuntimeState::Running;
        log::info!(
            "hgc runtime started (heap capacity {} bytes)",
            self.config.heap_capacity
        );
        Ok(())
    }

    /// Stop runtime
    ///
    /// With `run_finalizers_on_exit`, a final collection runs and every
    /// pending finalizer is given the chance to complete. A finalizer thread
    /// that does not exit within `shutdown_timeout_ms` is left detached and
    /// logged; stopping still succeeds. Stopping twice is a no-op.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                RuntimeState::Stopped | RuntimeState::Stopping => return Ok(()),
                _ => *state = RuntimeState::Stopping,
            }
        }

        let run_pending = self.config.run_finalizers_on_exit;
        if run_pending {
            if let Err(e) = self.gc.collect(GcReason::Shutdown) {
                log::warn!("shutdown collection failed: {}", e);
            }
        }

        match self.finalizer.stop(run_pending, self.config.shutdown_timeout()) {
            Ok(()) => {},
            Err(HgcError::Timeout(message)) => log::warn!("{}", message),
            Err(e) => return Err(e),
        }

        *self.state.lock() = RuntimeState::Stopped;
        log::info!("hgc runtime stopped");
        Ok(())
    }

    /// Get runtime state
    pub fn state(&self) -> RuntimeState {
        *self.state.lock()
    }

    // === Objects ===

    /// Allocate an object, collecting if the heap is full
    pub fn allocate(&self, builder: ObjectBuilder) -> Result<Root> {
        self.ensure_not_stopped()?;
        self.gc.allocate(builder)
    }

    /// Run a full collection
    pub fn collect(&self) -> Result<CollectionReport> {
        self.ensure_not_stopped()?;
        self.gc.collect(GcReason::Explicit)
    }

    pub fn new_soft_reference(&self, referent: &Root, queue: Option<&ReferenceQueue>) -> Result<Reference> {
        Reference::new(&self.heap, ReferenceKind::Soft, referent, queue)
    }

    pub fn new_weak_reference(&self, referent: &Root, queue: Option<&ReferenceQueue>) -> Result<Reference> {
        Reference::new(&self.heap, ReferenceKind::Weak, referent, queue)
    }

    /// Phantom references are only useful with a queue, so one is required
    pub fn new_phantom_reference(&self, referent: &Root, queue: &ReferenceQueue) -> Result<Reference> {
        Reference::new(&self.heap, ReferenceKind::Phantom, referent, Some(queue))
    }

    // === Finalization ===

    /// Wait for every scheduled finalizer to run
    ///
    /// Returns false on timeout.
    pub fn run_finalization(&self, timeout: Duration) -> bool {
        self.finalizer.run_finalization(Some(timeout))
    }

    /// Finalizers scheduled and not yet run
    pub fn pending_finalizers(&self) -> usize {
        self.finalizer.pending()
    }

    // === Threads ===

    /// Attach the calling thread as a mutator
    pub fn attach_current_thread(&self, name: &str) -> Result<MutatorThread> {
        self.control.safepoints.attach(name)
    }

    /// Safepoint poll for the calling thread; a no-op when not attached
    pub fn check_safepoint(&self) {
        thread::poll_current(&self.control.safepoints);
    }

    /// Increment the suspend count of `target`, returns the new count
    ///
    /// Suspending the calling thread parks it until another thread resumes
    /// it.
    pub fn suspend_thread(&self, target: ThreadId) -> Result<u32> {
        self.control.suspend(target)
    }

    /// Decrement the suspend count of `target`, returns the new count
    pub fn resume_thread(&self, target: ThreadId) -> Result<u32> {
        self.control.resume(target)
    }

    /// Interrupt `target`, waking it from a reference queue wait
    pub fn interrupt_thread(&self, target: ThreadId) -> Result<()> {
        self.control.safepoints.interrupt(target)
    }

    pub fn is_thread_suspended(&self, target: ThreadId) -> Result<bool> {
        self.control.safepoints.is_suspended(target)
    }

    /// Wait until `target` has parked after a suspend
    pub fn wait_for_suspension(&self, target: ThreadId, timeout: Duration) -> Result<bool> {
        self.control.safepoints.wait_for_suspension(target, timeout)
    }

    pub fn thread_info(&self, target: ThreadId) -> Result<ThreadInfo> {
        self.control.safepoints.thread_info(target)
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.control.safepoints.threads()
    }

    // === Agents ===

    /// Register a native agent; dropping the handle unregisters it
    pub fn register_agent(&self, agent: Arc<dyn NativeAgent>) -> AgentHandle {
        let (id, capabilities) = self.control.native.register(agent);
        AgentHandle::new(id, capabilities, self.control.clone())
    }

    // === Accessors ===

    pub fn gc(&self) -> &Arc<GarbageCollector> {
        &self.gc
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn stats(&self) -> &Arc<GcStats> {
        &self.stats
    }

    pub fn logger(&self) -> &Arc<GcLogger> {
        &self.control.logger
    }

    pub fn safepoints(&self) -> &Arc<SafepointManager> {
        &self.control.safepoints
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    fn ensure_not_stopped(&self) -> Result<()> {
        match self.state() {
            RuntimeState::Stopped => Err(HgcError::ShutDown),
            _ => Ok(()),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("runtime stop during drop failed: {}", e);
        }
    }
}

/// Runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Runtime not yet started
    Initialized,
    /// Runtime running normally
    Running,
    /// Runtime is stopping
    Stopping,
    /// Runtime has stopped
    Stopped,
}
