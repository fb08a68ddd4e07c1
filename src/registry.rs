//! Fan-out of stats to every registered [`Stater`].
//!
//! Every stater gets its own dispatch thread fed by a bounded queue, so a stater that is slow or
//! stuck only ever fills its own queue and never delays another one, or the caller. Once a
//! stater's queue is full, further stats for it are dropped. Lifecycle calls are the opposite:
//! `init` and `shutdown` run on every stater in parallel but only return once all of them have
//! finished.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

use crate::common::StaterError;
use crate::governor::panic_message;
use crate::stater::Stater;

/// How many stats can wait for a single stater before new ones are dropped.
const LANE_CAPACITY: usize = 1024;

type Job = Arc<dyn Fn(&dyn Stater) + Send + Sync>;

/// A registered stater and the queue feeding its dispatch thread.
struct Lane {
    stater: Arc<dyn Stater>,
    jobs: Sender<Job>,
}

impl Lane {
    fn open(stater: Arc<dyn Stater>) -> Self {
        let (jobs, queue) = flume::bounded(LANE_CAPACITY);
        let worker = Arc::clone(&stater);
        if let Err(e) = thread::Builder::new()
            .name("stater-dispatch".to_string())
            .spawn(move || dispatch(worker, queue))
        {
            error!(error = %e, "failed to spawn dispatch thread, stats for this stater will be dropped");
        }
        Lane { stater, jobs }
    }

    fn push(&self, job: Job) {
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("stater is falling behind, dropping stat"),
            Err(TrySendError::Disconnected(_)) => {
                debug!("stater has no dispatch thread, dropping stat")
            }
        }
    }
}

/// Runs queued stats against one stater until its lane is dropped.
fn dispatch(stater: Arc<dyn Stater>, queue: Receiver<Job>) {
    for job in queue.iter() {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| job(stater.as_ref()))) {
            error!(panic = panic_message(panic.as_ref()), "stater panicked");
        }
    }
    debug!("stater dispatch thread stopped");
}

#[derive(Default)]
struct Inner {
    lanes: RwLock<Vec<Lane>>,
}

/// A set of staters that every stat is broadcast to.
///
/// Cloning is cheap and clones share the same set. Stats reach each stater in the order they
/// were sent, but there is no ordering across staters.
///
/// Staters registered after [`init`][Registry::init] are not initialized automatically: call
/// their `init` yourself, or call the registry's `init` again if every registered stater
/// tolerates repeated initialization.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Adds a stater to the registry.
    pub fn register<S: Stater>(&self, stater: S) -> &Self {
        self.register_arc(Arc::new(stater))
    }

    /// Adds a shared stater to the registry. Registering the same `Arc` twice has no effect.
    pub fn register_arc(&self, stater: Arc<dyn Stater>) -> &Self {
        let mut lanes = self.inner.lanes.write();
        let id = Arc::as_ptr(&stater) as *const ();
        if lanes
            .iter()
            .any(|lane| Arc::as_ptr(&lane.stater) as *const () == id)
        {
            debug!("stater already registered");
        } else {
            lanes.push(Lane::open(stater));
            info!(staters = lanes.len(), "registered stater");
        }
        self
    }

    pub fn len(&self) -> usize {
        self.inner.lanes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lanes.read().is_empty()
    }

    pub fn timer(&self, key: &str, value: Duration, rate: f32) {
        let key: Arc<str> = Arc::from(key);
        self.broadcast(move |stater| stater.timer(&key, value, rate));
    }

    pub fn gauge(&self, key: &str, value: f64, rate: f32) {
        let key: Arc<str> = Arc::from(key);
        self.broadcast(move |stater| stater.gauge(&key, value, rate));
    }

    pub fn increment(&self, key: &str, value: i64, rate: f32) {
        let key: Arc<str> = Arc::from(key);
        self.broadcast(move |stater| stater.increment(&key, value, rate));
    }

    /// Initializes every stater in parallel and waits for all of them.
    ///
    /// If a stater never finishes initializing, neither does this call.
    ///
    /// ## Errors
    ///
    /// Returns the first error reported by a stater; any other failures are logged.
    pub fn init(&self) -> Result<(), StaterError> {
        let mut errors = self
            .lifecycle("init", |stater| stater.init())
            .into_iter()
            .filter_map(Result::err);

        let first = errors.next();
        for e in errors {
            error!(error = %e, "stater failed to initialize");
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shuts every stater down in parallel and waits for all of them.
    pub fn shutdown(&self) {
        for result in self.lifecycle("shutdown", |stater| {
            stater.shutdown();
            Ok(())
        }) {
            if let Err(e) = result {
                error!(error = %e, "stater failed to shut down");
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Stater>> {
        self.inner
            .lanes
            .read()
            .iter()
            .map(|lane| Arc::clone(&lane.stater))
            .collect()
    }

    fn broadcast<F>(&self, call: F)
    where
        F: Fn(&dyn Stater) + Send + Sync + 'static,
    {
        let lanes = self.inner.lanes.read();
        if lanes.is_empty() {
            return;
        }

        let job: Job = Arc::new(call);
        for lane in lanes.iter() {
            lane.push(Arc::clone(&job));
        }
    }

    fn lifecycle<F>(&self, step: &'static str, call: F) -> Vec<Result<(), StaterError>>
    where
        F: Fn(&dyn Stater) -> Result<(), StaterError> + Sync,
    {
        let staters = self.snapshot();
        // let staters that need a runtime find the caller's one
        let handle = Handle::try_current().ok();

        thread::scope(|scope| {
            let threads: Vec<_> = staters
                .iter()
                .map(|stater| {
                    let call = &call;
                    let handle = handle.as_ref();
                    thread::Builder::new()
                        .name(format!("stater-{step}"))
                        .spawn_scoped(scope, move || {
                            let _g = handle.map(Handle::enter);
                            call(stater.as_ref())
                        })
                        .map_err(|e| StaterError::FailedToSpawn(e.to_string()))
                })
                .collect();

            threads
                .into_iter()
                .map(|spawned| {
                    spawned?
                        .join()
                        .unwrap_or(Err(StaterError::BackendPanicked(step)))
                })
                .collect()
        })
    }
}

static DEFAULT_REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry used by the crate-level free functions.
pub fn default_registry() -> &'static Registry {
    DEFAULT_REGISTRY.get_or_init(Registry::new)
}
