//! Native Agent Interface
//!
//! Profilers, debuggers and similar agents attach here. An agent declares
//! the capabilities it needs when it registers; events are only delivered,
//! and thread control only permitted, for capabilities it holds.

use super::safepoint::SafepointManager;
use super::thread::{self, ThreadId, ThreadInfo};
use crate::error::{HgcError, Result};
use crate::logging::{GcEvent, GcLogger};
use crate::object::ObjectId;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What an agent may observe and do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentCapabilities {
    /// Receive `GcStarted` / `GcFinished` / `FinalizerPanicked`
    pub gc_events: bool,
    /// Receive `ThreadSuspended` / `ThreadResumed`
    pub thread_events: bool,
    /// Suspend and resume mutator threads
    pub can_suspend: bool,
}

impl AgentCapabilities {
    /// Every capability
    pub fn all() -> Self {
        Self {
            gc_events: true,
            thread_events: true,
            can_suspend: true,
        }
    }

    fn allows(&self, event: &NativeEvent) -> bool {
        match event {
            NativeEvent::GcStarted { .. }
            | NativeEvent::GcFinished { .. }
            | NativeEvent::FinalizerPanicked { .. } => self.gc_events,
            NativeEvent::ThreadSuspended { .. } | NativeEvent::ThreadResumed { .. } => {
                self.thread_events
            },
        }
    }
}

/// Event delivered to agents
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum NativeEvent {
    GcStarted {
        cycle: u64,
    },
    GcFinished {
        cycle: u64,
        reclaimed_objects: usize,
        reclaimed_bytes: usize,
    },
    ThreadSuspended {
        thread: ThreadId,
        suspend_count: u32,
    },
    ThreadResumed {
        thread: ThreadId,
        suspend_count: u32,
    },
    FinalizerPanicked {
        object: ObjectId,
        message: String,
    },
}

/// An attached agent
///
/// `on_event` runs on whichever thread produced the event: the collecting
/// thread, the finalizer thread or the thread that changed a suspend count.
pub trait NativeAgent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AgentCapabilities;

    fn on_event(&self, event: &NativeEvent);
}

/// Agent that ignores everything
pub struct NoopAgent;

impl NativeAgent for NoopAgent {
    fn name(&self) -> &str {
        "noop"
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities::default()
    }

    fn on_event(&self, _event: &NativeEvent) {}
}

struct RegisteredAgent {
    id: u64,
    capabilities: AgentCapabilities,
    agent: Arc<dyn NativeAgent>,
}

/// Registry of attached agents
pub struct NativeInterface {
    agents: RwLock<Vec<RegisteredAgent>>,
    next_agent_id: AtomicU64,
    events_dispatched: AtomicU64,
}

impl NativeInterface {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(Vec::new()),
            next_agent_id: AtomicU64::new(1),
            events_dispatched: AtomicU64::new(0),
        }
    }

    /// Register an agent, its capabilities are fixed at this point
    pub fn register(&self, agent: Arc<dyn NativeAgent>) -> (u64, AgentCapabilities) {
        let id = self.next_agent_id.fetch_add(1, Ordering::Relaxed);
        let capabilities = agent.capabilities();
        log::debug!(
            "agent '{}' registered as #{} with {:?}",
            agent.name(),
            id,
            capabilities
        );
        self.agents.write().push(RegisteredAgent {
            id,
            capabilities,
            agent,
        });
        (id, capabilities)
    }

    pub fn unregister(&self, id: u64) -> bool {
        let mut agents = self.agents.write();
        let before = agents.len();
        agents.retain(|registered| registered.id != id);
        agents.len() != before
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    /// Deliver `event` to every agent whose capabilities allow it
    pub fn dispatch(&self, event: &NativeEvent) {
        let recipients: Vec<Arc<dyn NativeAgent>> = self
            .agents
            .read()
            .iter()
            .filter(|registered| registered.capabilities.allows(event))
            .map(|registered| Arc::clone(&registered.agent))
            .collect();

        // Lock released so agents may register or unregister from a callback
        for agent in recipients {
            agent.on_event(event);
            self.events_dispatched.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn events_dispatched(&self) -> u64 {
        self.events_dispatched.load(Ordering::Relaxed)
    }
}

impl Default for NativeInterface {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread control shared by [`Runtime`](crate::Runtime) and [`AgentHandle`]
///
/// Adjusts the suspend count, then reports it to the logger and to agents.
/// A thread suspending itself parks before this returns.
#[derive(Clone)]
pub(crate) struct ThreadControl {
    pub(crate) safepoints: Arc<SafepointManager>,
    pub(crate) native: Arc<NativeInterface>,
    pub(crate) logger: Arc<GcLogger>,
}

impl ThreadControl {
    pub(crate) fn suspend(&self, target: ThreadId) -> Result<u32> {
        let count = self.safepoints.request_suspend(target)?;
        self.logger.log(GcEvent::ThreadSuspended {
            thread: target.to_string(),
            suspend_count: count,
        });
        self.native.dispatch(&NativeEvent::ThreadSuspended {
            thread: target,
            suspend_count: count,
        });

        if thread::current_id_for(&self.safepoints) == Some(target) {
            thread::poll_current(&self.safepoints);
        }
        Ok(count)
    }

    pub(crate) fn resume(&self, target: ThreadId) -> Result<u32> {
        let Some(count) = self.safepoints.resume(target)? else {
            return Ok(0);
        };
        self.logger.log(GcEvent::ThreadResumed {
            thread: target.to_string(),
            suspend_count: count,
        });
        self.native.dispatch(&NativeEvent::ThreadResumed {
            thread: target,
            suspend_count: count,
        });
        Ok(count)
    }
}

/// Registration of one agent with a runtime
///
/// Dropping the handle unregisters the agent.
pub struct AgentHandle {
    id: u64,
    capabilities: AgentCapabilities,
    control: ThreadControl,
}

impl AgentHandle {
    pub(crate) fn new(id: u64, capabilities: AgentCapabilities, control: ThreadControl) -> Self {
        Self {
            id,
            capabilities,
            control,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capabilities(&self) -> AgentCapabilities {
        self.capabilities
    }

    /// Suspend `target`; requires `can_suspend`
    pub fn suspend_thread(&self, target: ThreadId) -> Result<u32> {
        self.require_suspend()?;
        self.control.suspend(target)
    }

    /// Resume `target`; requires `can_suspend`
    pub fn resume_thread(&self, target: ThreadId) -> Result<u32> {
        self.require_suspend()?;
        self.control.resume(target)
    }

    /// Wait until `target` has parked after a suspend
    pub fn wait_for_suspension(&self, target: ThreadId, timeout: Duration) -> Result<bool> {
        self.require_suspend()?;
        self.control.safepoints.wait_for_suspension(target, timeout)
    }

    pub fn thread_info(&self, target: ThreadId) -> Result<ThreadInfo> {
        self.control.safepoints.thread_info(target)
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.control.safepoints.threads()
    }

    fn require_suspend(&self) -> Result<()> {
        if self.capabilities.can_suspend {
            Ok(())
        } else {
            Err(HgcError::MissingCapability("can_suspend"))
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.control.native.unregister(self.id);
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        capabilities: AgentCapabilities,
        events: Mutex<Vec<NativeEvent>>,
    }

    impl NativeAgent for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn capabilities(&self) -> AgentCapabilities {
            self.capabilities
        }

        fn on_event(&self, event: &NativeEvent) {
            self.events.lock().push(event.clone());
        }
    }

    #[test]
    fn test_dispatch_respects_capabilities() {
        let native = NativeInterface::new();
        let gc_only = Arc::new(Recorder {
            capabilities: AgentCapabilities {
                gc_events: true,
                ..Default::default()
            },
            events: Mutex::new(Vec::new()),
        });
        native.register(gc_only.clone());

        native.dispatch(&NativeEvent::GcStarted { cycle: 1 });
        native.dispatch(&NativeEvent::ThreadSuspended {
            thread: ThreadId::from_raw(1),
            suspend_count: 1,
        });

        assert_eq!(*gc_only.events.lock(), vec![NativeEvent::GcStarted { cycle: 1 }]);
        assert_eq!(native.events_dispatched(), 1);
    }

    #[test]
    fn test_unregister() {
        let native = NativeInterface::new();
        let (id, caps) = native.register(Arc::new(NoopAgent));
        assert_eq!(caps, AgentCapabilities::default());
        assert_eq!(native.agent_count(), 1);
        assert!(native.unregister(id));
        assert!(!native.unregister(id));
        assert_eq!(native.agent_count(), 0);
    }

    #[test]
    fn test_agent_without_suspend_capability_is_refused() {
        let native = Arc::new(NativeInterface::new());
        let control = ThreadControl {
            safepoints: Arc::new(SafepointManager::default()),
            native: Arc::clone(&native),
            logger: Arc::new(GcLogger::default()),
        };
        let (id, caps) = native.register(Arc::new(NoopAgent));
        let handle = AgentHandle::new(id, caps, control);

        assert!(matches!(
            handle.suspend_thread(ThreadId::from_raw(1)),
            Err(HgcError::MissingCapability("can_suspend"))
        ));
        drop(handle);
        assert_eq!(native.agent_count(), 0);
    }

    #[test]
    fn test_racing_resumes_report_one_transition() {
        let native = Arc::new(NativeInterface::new());
        let recorder = Arc::new(Recorder {
            capabilities: AgentCapabilities {
                thread_events: true,
                ..Default::default()
            },
            events: Mutex::new(Vec::new()),
        });
        native.register(recorder.clone());
        let control = ThreadControl {
            safepoints: Arc::new(SafepointManager::default()),
            native,
            logger: Arc::new(GcLogger::default()),
        };
        let target = control.safepoints.attach("target").unwrap();
        control.safepoints.request_suspend(target.id()).unwrap();

        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let control = control.clone();
                let barrier = Arc::clone(&barrier);
                let id = target.id();
                std::thread::spawn(move || {
                    barrier.wait();
                    control.resume(id).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0);
        }

        let resumed = recorder
            .events
            .lock()
            .iter()
            .filter(|event| matches!(event, NativeEvent::ThreadResumed { .. }))
            .count();
        assert_eq!(resumed, 1);
        assert_eq!(control.safepoints.thread_info(target.id()).unwrap().suspend_count, 0);
    }
}
