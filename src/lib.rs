//! A metrics client that fans stats out to any number of backends.
//!
//! ## Basics
//!
//! `stater` lets an application emit timers, gauges and counters without caring where they end
//! up. Every stat is broadcast to all registered [`Stater`] backends; the one shipped with the
//! crate, [`StatsdSender`], pushes them to a statsd server over UDP.
//!
//! ## High-level features
//!
//! - per-call sampling with statsd `|@rate` annotations
//! - a [`Registry`] that dispatches each stat to every backend independently, so a slow backend
//!   never holds up another one or the caller
//! - a UDP sender that never blocks the caller for longer than a bounded enqueue wait and
//!   reconnects on its own, at most once per reconnect interval, through a [`Governor`]
//! - a [`metrics`]-compatible recorder forwarding the `metrics` macros into a registry
//!
//! ## Behavior
//!
//! This client makes some explicit trade-offs to accomplish its task:
//!
//! - Delivery is fire-and-forget: stats are dropped when the send buffer stays full, while the
//!   connection is being re-established, and whenever the network drops a datagram
//! - Nothing is aggregated locally, every accepted stat is sent as its own datagram
//! - Timers are sent in whole milliseconds
//! - Lines end with `\n` unless configured otherwise
//! - There is no ordering guarantee between stats emitted by different calls
//! - Background work runs on the caller's Tokio runtime when there is one, and on a small
//!   runtime owned by the crate otherwise
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//!
//! // Build a sender for a statsd server and register it with the process-wide registry.
//! let sender = stater::StatsdBuilder::new()
//!     .with_endpoint("127.0.0.1:8125")
//!     .set_reconnect_interval(Duration::from_secs(1))
//!     .build()
//!     .expect("failed to build statsd sender");
//! stater::register(sender);
//!
//! // Initialize every registered backend. This waits for all of them and fails loudly if the
//! // endpoint can't be resolved.
//! stater::init().expect("failed to initialize staters");
//!
//! stater::increment("requests", 1, 1.0);
//! stater::gauge("queue.depth", 12.0, 1.0);
//! stater::timer("request.latency", Duration::from_millis(42), 0.1);
//!
//! stater::shutdown();
//! ```
//!
//! Applications that prefer not to use global state can create their own [`Registry`] and pass
//! it around instead; the free functions are only a thin layer over [`default_registry`].
mod common;
pub use self::common::{LineEnding, QueueFullPolicy, StaterError};

mod builder;
pub use self::builder::StatsdBuilder;

pub mod formatting;

mod governor;
pub use self::governor::Governor;

mod recorder;
pub use self::recorder::StaterRecorder;

mod registry;
pub use self::registry::{default_registry, Registry};

mod runtime;

pub mod sampler;
pub use self::sampler::can_sample;

mod stater;
pub use self::stater::Stater;

mod statsd;
pub use self::statsd::StatsdSender;

use std::time::Duration;

/// Adds a stater to the default registry.
pub fn register<S: Stater>(stater: S) {
    default_registry().register(stater);
}

/// Sends a timer to every stater in the default registry.
pub fn timer(key: &str, value: Duration, rate: f32) {
    default_registry().timer(key, value, rate);
}

/// Sends a gauge to every stater in the default registry.
pub fn gauge(key: &str, value: f64, rate: f32) {
    default_registry().gauge(key, value, rate);
}

/// Sends a counter increment to every stater in the default registry.
pub fn increment(key: &str, value: i64, rate: f32) {
    default_registry().increment(key, value, rate);
}

/// Initializes every stater in the default registry, waiting for all of them.
///
/// ## Errors
///
/// Returns the first error reported by a stater.
pub fn init() -> Result<(), StaterError> {
    default_registry().init()
}

/// Shuts down every stater in the default registry, waiting for all of them.
pub fn shutdown() {
    default_registry().shutdown();
}
