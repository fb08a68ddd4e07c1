use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors that could occur while building or initializing a stater.
#[derive(Debug, Error)]
pub enum StaterError {
    /// No statsd endpoint was configured before building the sender.
    #[error("no statsd endpoint has been configured")]
    MissingEndpoint,

    /// The statsd endpoint could not be resolved into a socket address.
    #[error("statsd endpoint '{0}' is not valid: {1}")]
    InvalidEndpoint(String, String),

    /// The send buffer must be able to hold at least one stat.
    #[error("send buffer size must be greater than zero")]
    EmptyBuffer,

    /// Binding or connecting the UDP socket failed.
    #[error("failed to connect to statsd endpoint {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Creating a Tokio runtime to drive background work failed.
    #[error("failed to create Tokio runtime: {0}")]
    FailedToCreateRuntime(String),

    /// A thread used to run a lifecycle call could not be spawned.
    #[error("failed to spawn lifecycle thread: {0}")]
    FailedToSpawn(String),

    /// A registered stater panicked during `init` or `shutdown`.
    #[error("stater panicked during {0}")]
    BackendPanicked(&'static str),

    /// A global `metrics` recorder was already installed.
    #[error("a global metrics recorder is already installed")]
    RecorderAlreadyInstalled,
}

/// Terminator appended to every line put on the wire.
///
/// The receiving aggregator frames stats on this, so it must match whatever the deployed
/// aggregator expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LineEnding {
    /// `\n`
    #[default]
    Lf,
    /// `\r\n`
    CrLf,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }
}

/// What to do with a stat when the send buffer is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueFullPolicy {
    /// Drop the stat immediately.
    Drop,
    /// Wait up to the given duration for room, then drop the stat.
    Wait(Duration),
}

impl Default for QueueFullPolicy {
    fn default() -> Self {
        Self::Wait(Duration::from_millis(10))
    }
}
