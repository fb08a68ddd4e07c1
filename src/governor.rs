//! A rate-limited, single-flight executor.
//!
//! A [`Governor`] wraps an action so that no matter how often, or from how many threads, it is
//! called, the action runs at most once per interval. The window starts when an execution
//! starts and lasts `max(interval, execution time)`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use quanta::Instant;
use tracing::{debug, error};

type Action = Arc<dyn Fn() + Send + Sync + 'static>;

struct Settings {
    interval: Duration,
    blocking: bool,
    action: Action,
}

#[derive(Default)]
struct Gate {
    ready: bool,
    running: bool,
    /// Bumped on every run, so a run only re-arms the gate if no later run has started.
    generation: u64,
}

/// Runs an action at most once per interval, however many threads call it.
pub struct Governor {
    /// Lock-free mirror of `Gate::ready` for the fast path.
    ready: AtomicBool,
    gate: Mutex<Gate>,
    ready_cond: Condvar,
    settings: Mutex<Settings>,
}

impl Governor {
    /// Creates a governor that is ready to run `action` immediately.
    pub fn new<F>(interval: Duration, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Governor {
            ready: AtomicBool::new(true),
            gate: Mutex::new(Gate {
                ready: true,
                ..Gate::default()
            }),
            ready_cond: Condvar::new(),
            settings: Mutex::new(Settings {
                interval,
                blocking: false,
                action: Arc::new(action),
            }),
        }
    }

    pub fn set_interval(&self, interval: Duration) {
        self.settings.lock().interval = interval;
    }

    /// When blocking, callers that find the governor busy wait until it is ready again instead
    /// of returning straight away.
    pub fn set_blocking(&self, blocking: bool) {
        self.settings.lock().blocking = blocking;
    }

    /// Replaces the governed action. An execution already in flight keeps running the old one.
    pub fn set_func<F>(&self, action: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.settings.lock().action = Arc::new(action);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Runs the action if the governor is ready.
    ///
    /// If it isn't, this either returns immediately or, in blocking mode, waits for the current
    /// window to close and then returns. A waiting caller does not run the action itself.
    ///
    /// The caller that does run the action also waits out the rest of the interval before the
    /// governor becomes ready again, so this should be called from a thread that can block.
    pub fn call(&self) {
        // quick check
        if !self.is_ready() {
            self.wait_if_blocking();
            return;
        }

        // slower check, under the lock
        let generation = {
            let mut gate = self.gate.lock();
            if !gate.ready || gate.running {
                drop(gate);
                self.wait_if_blocking();
                return;
            }
            gate.ready = false;
            gate.running = true;
            gate.generation = gate.generation.wrapping_add(1);
            self.ready.store(false, Ordering::Release);
            gate.generation
        };

        let (interval, action) = {
            let settings = self.settings.lock();
            (settings.interval, Arc::clone(&settings.action))
        };

        let start = Instant::now();
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| action())) {
            error!(
                panic = panic_message(panic.as_ref()),
                "governed action panicked"
            );
        }

        self.gate.lock().running = false;

        // after our wait, just reset the ready state
        let elapsed = Instant::now().saturating_duration_since(start);
        if let Some(remainder) = interval.checked_sub(elapsed) {
            thread::sleep(remainder);
        }

        let gate = self.gate.lock();
        if gate.generation == generation {
            self.arm(gate);
        }
    }

    /// Makes the governor ready right away, bypassing the interval, and wakes any waiters.
    ///
    /// The next call runs the action immediately unless an execution is still in flight.
    pub fn ready(&self) {
        self.arm(self.gate.lock());
    }

    fn arm(&self, mut gate: MutexGuard<'_, Gate>) {
        gate.ready = true;
        self.ready.store(true, Ordering::Release);
        self.ready_cond.notify_all();
        debug!(running = gate.running, "governor ready");
    }

    fn wait_if_blocking(&self) {
        if !self.settings.lock().blocking {
            return;
        }
        let mut gate = self.gate.lock();
        while !gate.ready {
            self.ready_cond.wait(&mut gate);
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
