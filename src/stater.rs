use std::time::Duration;

use crate::common::StaterError;

/// A backend that receives stats.
///
/// The stat methods are fire-and-forget: implementations must never surface transport problems
/// to the caller and should not block for long. `init` and `shutdown` are blocking lifecycle
/// calls which must have completed by the time they return.
///
/// Sample rates are probabilities in `(0, 1]`; a rate of `1.0` means "always send".
pub trait Stater: Send + Sync + 'static {
    /// Records how long something took.
    fn timer(&self, key: &str, value: Duration, rate: f32);

    /// Records the current value of something.
    fn gauge(&self, key: &str, value: f64, rate: f32);

    /// Adds `value` (which may be negative) to a counter.
    fn increment(&self, key: &str, value: i64, rate: f32);

    /// Prepares the backend for receiving stats.
    ///
    /// ## Errors
    ///
    /// Implementations return an error when they are misconfigured and cannot start at all.
    fn init(&self) -> Result<(), StaterError>;

    /// Stops the backend. Must be safe to call even if `init` failed or was never called.
    fn shutdown(&self);
}
