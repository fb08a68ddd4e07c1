use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};
use metrics_util::registry::{Registry as HandleRegistry, Storage};
use portable_atomic::AtomicU64;

use crate::common::StaterError;
use crate::registry::Registry;

/// Forwards counter updates as increments.
pub(crate) struct ForwardedCounter {
    name: Arc<str>,
    /// Last absolute value seen, so `absolute` can be turned into an increment.
    last: AtomicU64,
    registry: Registry,
}

impl CounterFn for ForwardedCounter {
    fn increment(&self, value: u64) {
        self.last.fetch_add(value, Ordering::AcqRel);
        self.increment_delta(value);
    }

    fn absolute(&self, value: u64) {
        let previous = self.last.swap(value, Ordering::AcqRel);
        if value > previous {
            self.increment_delta(value - previous);
        }
    }
}

impl ForwardedCounter {
    fn increment_delta(&self, delta: u64) {
        self.registry
            .increment(&self.name, i64::try_from(delta).unwrap_or(i64::MAX), 1.0);
    }
}

/// Keeps the gauge's current value so relative updates can be sent as absolute ones.
pub(crate) struct ForwardedGauge {
    name: Arc<str>,
    value: AtomicU64,
    registry: Registry,
}

impl ForwardedGauge {
    fn update(&self, f: impl Fn(f64) -> f64) {
        let mut current = self.value.load(Ordering::Acquire);
        let new = loop {
            let new = f(f64::from_bits(current));
            match self.value.compare_exchange_weak(
                current,
                new.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break new,
                Err(actual) => current = actual,
            }
        };
        self.registry.gauge(&self.name, new, 1.0);
    }
}

impl GaugeFn for ForwardedGauge {
    fn increment(&self, value: f64) {
        self.update(|current| current + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|current| current - value);
    }

    fn set(&self, value: f64) {
        self.update(|_| value);
    }
}

/// Histogram values are taken to be durations in seconds.
pub(crate) struct ForwardedHistogram {
    name: Arc<str>,
    registry: Registry,
}

impl HistogramFn for ForwardedHistogram {
    fn record(&self, value: f64) {
        match Duration::try_from_secs_f64(value) {
            Ok(duration) => self.registry.timer(&self.name, duration, 1.0),
            Err(_) => tracing::debug!(name = %self.name, value, "ignoring invalid duration"),
        }
    }
}

pub(crate) struct ForwardingStorage {
    registry: Registry,
}

impl Storage<Key> for ForwardingStorage {
    type Counter = Arc<ForwardedCounter>;
    type Gauge = Arc<ForwardedGauge>;
    type Histogram = Arc<ForwardedHistogram>;

    fn counter(&self, key: &Key) -> Self::Counter {
        Arc::new(ForwardedCounter {
            name: Arc::from(key.name()),
            last: AtomicU64::new(0),
            registry: self.registry.clone(),
        })
    }

    fn gauge(&self, key: &Key) -> Self::Gauge {
        Arc::new(ForwardedGauge {
            name: Arc::from(key.name()),
            value: AtomicU64::new(0.0f64.to_bits()),
            registry: self.registry.clone(),
        })
    }

    fn histogram(&self, key: &Key) -> Self::Histogram {
        Arc::new(ForwardedHistogram {
            name: Arc::from(key.name()),
            registry: self.registry.clone(),
        })
    }
}

/// A [`metrics`] recorder that forwards everything recorded through the `metrics` macros to the
/// staters of a [`Registry`].
///
/// Counters become increments, gauges are sent with their current value and histograms become
/// timers, reading recorded values as seconds. Labels are not forwarded.
pub struct StaterRecorder {
    handles: HandleRegistry<Key, ForwardingStorage>,
}

impl StaterRecorder {
    pub fn new(registry: Registry) -> Self {
        StaterRecorder {
            handles: HandleRegistry::new(ForwardingStorage { registry }),
        }
    }

    /// Installs this recorder as the global `metrics` recorder.
    ///
    /// ## Errors
    ///
    /// If a global recorder was already installed, an error variant will be returned.
    pub fn install(self) -> Result<(), StaterError> {
        metrics::set_global_recorder(self).map_err(|_| StaterError::RecorderAlreadyInstalled)
    }
}

impl From<Registry> for StaterRecorder {
    fn from(registry: Registry) -> Self {
        StaterRecorder::new(registry)
    }
}

impl Recorder for StaterRecorder {
    fn describe_counter(&self, _k: KeyName, _u: Option<Unit>, _d: SharedString) {}
    fn describe_gauge(&self, _k: KeyName, _u: Option<Unit>, _d: SharedString) {}
    fn describe_histogram(&self, _k: KeyName, _u: Option<Unit>, _d: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        self.handles
            .get_or_create_counter(key, |c| Counter::from_arc(c.clone()))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        self.handles
            .get_or_create_gauge(key, |g| Gauge::from_arc(g.clone()))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        self.handles
            .get_or_create_histogram(key, |h| Histogram::from_arc(h.clone()))
    }
}
