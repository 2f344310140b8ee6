//! Finalizer Thread
//!
//! One dedicated thread runs every finalizer, never a mutator. The collector
//! hands over batches of jobs through a channel after the world restarts.
//! Each job holds a [`Root`] to its object, so the object and everything it
//! references survive until the finalizer has returned; a finalizer that
//! stores that root somewhere resurrects the object.
//!
//! A panicking finalizer is caught and reported; the thread carries on with
//! the next job. A finalizer that never returns stalls the ones behind it
//! but nothing else.

use super::native::{NativeEvent, NativeInterface};
use super::thread;
use crate::error::{HgcError, Result};
use crate::logging::{GcEvent, GcLogger};
use crate::object::{FinalizerFn, Root};
use crate::stats::GcStats;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// One finalizer to run
pub(crate) struct FinalizeJob {
    pub object: Root,
    pub finalizer: FinalizerFn,
}

enum FinalizerMessage {
    Run(Vec<FinalizeJob>),
    Shutdown { run_pending: bool },
}

/// Finalizer thread settings
#[derive(Debug, Clone)]
pub struct FinalizerConfig {
    pub thread_name: String,
    pub low_priority: bool,
    pub enabled: bool,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            thread_name: "hgc-finalizer".to_string(),
            low_priority: true,
            enabled: true,
        }
    }
}

struct FinalizerShared {
    /// Jobs sent and not yet run or discarded
    pending: AtomicUsize,
    progress: Mutex<()>,
    drained: Condvar,
    exited: Mutex<bool>,
    exited_signal: Condvar,
    stats: Arc<GcStats>,
    logger: Arc<GcLogger>,
    native: Arc<NativeInterface>,
}

impl FinalizerShared {
    fn job_done(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::AcqRel);
        let _progress = self.progress.lock();
        self.drained.notify_all();
    }

    fn run(&self, job: FinalizeJob) {
        let FinalizeJob { object, finalizer } = job;
        let id = object.id();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| finalizer(&object)));
        object.heap().finish_finalization(id);
        drop(object);

        match outcome {
            Ok(()) => self.stats.record_finalizer_completed(),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::warn!("finalizer for {} panicked: {}", id, message);
                self.logger.log(GcEvent::FinalizerPanicked {
                    object: id.to_string(),
                    message: message.clone(),
                });
                self.native
                    .dispatch(&NativeEvent::FinalizerPanicked { object: id, message });
                self.stats.record_finalizer_panicked();
            },
        }

        self.job_done(1);
    }

    fn discard(&self, jobs: Vec<FinalizeJob>) {
        let count = jobs.len();
        for job in jobs {
            job.object.heap().finish_finalization(job.object.id());
        }
        self.stats.record_finalizers_discarded(count);
        self.job_done(count);
    }
}

/// Finalizer - owner of the finalizer thread
pub struct Finalizer {
    config: FinalizerConfig,
    sender: Sender<FinalizerMessage>,
    receiver: Mutex<Option<Receiver<FinalizerMessage>>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    accepting: AtomicBool,
    shared: Arc<FinalizerShared>,
}

impl Finalizer {
    pub(crate) fn new(
        config: FinalizerConfig,
        stats: Arc<GcStats>,
        logger: Arc<GcLogger>,
        native: Arc<NativeInterface>,
    ) -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            config,
            sender,
            receiver: Mutex::new(Some(receiver)),
            thread_handle: Mutex::new(None),
            running: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            shared: Arc::new(FinalizerShared {
                pending: AtomicUsize::new(0),
                progress: Mutex::new(()),
                drained: Condvar::new(),
                exited: Mutex::new(false),
                exited_signal: Condvar::new(),
                stats,
                logger,
                native,
            }),
        }
    }

    /// Spawn the finalizer thread
    ///
    /// Jobs scheduled before this call are buffered and run once it starts.
    pub fn start(&self) -> Result<()> {
        let receiver = self.receiver.lock().take().ok_or_else(|| HgcError::InvalidState {
            expected: "finalizer not started".to_string(),
            actual: "finalizer already started or stopped".to_string(),
        })?;

        let shared = Arc::clone(&self.shared);
        let low_priority = self.config.low_priority;
        let handle = std::thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || {
                if low_priority {
                    lower_thread_priority();
                }
                finalizer_loop(&shared, receiver);
                *shared.exited.lock() = true;
                shared.exited_signal.notify_all();
            })
            .map_err(|e| HgcError::ThreadSpawn(e.to_string()))?;

        *self.thread_handle.lock() = Some(handle);
        self.running.store(true, Ordering::Release);
        log::debug!("finalizer thread '{}' started", self.config.thread_name);
        Ok(())
    }

    /// Hand jobs to the finalizer thread, returns how many were accepted
    pub(crate) fn schedule(&self, jobs: Vec<FinalizeJob>) -> usize {
        if jobs.is_empty() {
            return 0;
        }

        let count = jobs.len();
        if !self.config.enabled || !self.accepting.load(Ordering::Acquire) {
            log::debug!("discarding {} finalizers, finalizer thread not accepting", count);
            self.shared.pending.fetch_add(count, Ordering::AcqRel);
            self.shared.discard(jobs);
            return 0;
        }

        self.shared.pending.fetch_add(count, Ordering::AcqRel);
        match self.sender.send(FinalizerMessage::Run(jobs)) {
            Ok(()) => {
                self.shared.stats.record_finalizers_scheduled(count);
                count
            },
            Err(channel::SendError(message)) => {
                if let FinalizerMessage::Run(jobs) = message {
                    self.shared.discard(jobs);
                }
                0
            },
        }
    }

    /// Wait until every scheduled finalizer has run
    ///
    /// `None` waits indefinitely. Returns false on timeout, or immediately
    /// when work is pending but the thread is not running.
    pub fn run_finalization(&self, timeout: Option<Duration>) -> bool {
        if self.pending() == 0 {
            return true;
        }
        if !self.is_running() {
            return false;
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        thread::blocking(|| {
            let mut progress = self.shared.progress.lock();
            while self.shared.pending.load(Ordering::Acquire) > 0 {
                match deadline {
                    Some(deadline) => {
                        if self
                            .shared
                            .drained
                            .wait_until(&mut progress, deadline)
                            .timed_out()
                        {
                            return self.shared.pending.load(Ordering::Acquire) == 0;
                        }
                    },
                    None => self.shared.drained.wait(&mut progress),
                }
            }
            true
        })
    }

    /// Stop the thread
    ///
    /// With `run_pending`, jobs already queued run before the thread exits;
    /// otherwise they are discarded. Returns `Timeout` if the thread is
    /// still busy after `timeout`, in which case it is left detached.
    pub fn stop(&self, run_pending: bool, timeout: Duration) -> Result<()> {
        self.accepting.store(false, Ordering::Release);

        // Never started: drop whatever was buffered
        if let Some(receiver) = self.receiver.lock().take() {
            for message in receiver.try_iter() {
                if let FinalizerMessage::Run(jobs) = message {
                    self.shared.discard(jobs);
                }
            }
            return Ok(());
        }

        let Some(handle) = self.thread_handle.lock().take() else {
            return Ok(());
        };

        if self.sender.send(FinalizerMessage::Shutdown { run_pending }).is_err() {
            log::debug!(
                "finalizer thread '{}' already exited, shutdown request dropped",
                self.config.thread_name
            );
        }

        let deadline = Instant::now() + timeout;
        let exited = {
            let mut exited = self.shared.exited.lock();
            while !*exited {
                if self
                    .shared
                    .exited_signal
                    .wait_until(&mut exited, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            *exited
        };

        self.running.store(false, Ordering::Release);
        if exited {
            if handle.join().is_err() {
                log::error!("finalizer thread terminated abnormally");
            }
            log::debug!("finalizer thread '{}' stopped", self.config.thread_name);
            Ok(())
        } else {
            log::warn!(
                "finalizer thread '{}' did not exit within {:?}; detaching",
                self.config.thread_name,
                timeout
            );
            Err(HgcError::Timeout(format!(
                "finalizer thread did not exit within {:?}",
                timeout
            )))
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Finalizers scheduled and not yet run
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }
}

fn finalizer_loop(shared: &FinalizerShared, receiver: Receiver<FinalizerMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            FinalizerMessage::Run(jobs) => {
                for job in jobs {
                    shared.run(job);
                }
            },
            FinalizerMessage::Shutdown { run_pending } => {
                for message in receiver.try_iter() {
                    if let FinalizerMessage::Run(jobs) = message {
                        if run_pending {
                            for job in jobs {
                                shared.run(job);
                            }
                        } else {
                            shared.discard(jobs);
                        }
                    }
                }
                break;
            },
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Drop the calling thread to the lowest scheduling priority
#[cfg(target_os = "linux")]
fn lower_thread_priority() {
    // SAFETY: gettid has no preconditions; PRIO_PROCESS with a thread id only
    // affects that thread on Linux.
    let rc = unsafe {
        let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
        libc::setpriority(libc::PRIO_PROCESS, tid, 19)
    };
    if rc != 0 {
        log::debug!(
            "could not lower finalizer thread priority: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn lower_thread_priority() {}
