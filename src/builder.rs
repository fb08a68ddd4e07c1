use std::fmt::Display;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use indexmap::IndexMap;

use crate::common::{LineEnding, QueueFullPolicy, StaterError};
use crate::formatting::{format_sample_rate, render_tags, write_metric_line, MetricKind};
use crate::statsd::StatsdSender;

const DEFAULT_BUFFER_SIZE: usize = 1024;
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_SAMPLE_RATE_PRECISION: usize = 6;

/// Everything a [`StatsdSender`] needs to format and ship stats.
#[derive(Clone, Debug)]
pub(crate) struct SenderConfig {
    pub endpoint: String,
    pub buffer_size: usize,
    pub reconnect_interval: Duration,
    pub write_timeout: Duration,
    pub queue_full: QueueFullPolicy,
    pub line_ending: LineEnding,
    pub prefix: Option<String>,
    pub global_tags: Vec<String>,
    pub sample_rate_precision: usize,
}

impl SenderConfig {
    /// Formats a single stat line, including the sample rate suffix for rates other than 1.
    pub fn format<T: Display>(&self, kind: MetricKind, key: &str, value: T, rate: f32) -> String {
        let sample_rate =
            (rate != 1.0).then(|| format_sample_rate(rate, self.sample_rate_precision));
        let mut line = String::with_capacity(32);
        write_metric_line(
            &mut line,
            self.prefix.as_deref(),
            key,
            value,
            kind,
            sample_rate.as_deref(),
            &self.global_tags,
            self.line_ending,
        );
        line
    }

    /// Resolves the endpoint, using the first address it resolves to.
    pub fn resolve_endpoint(&self) -> Result<SocketAddr, StaterError> {
        self.endpoint
            .to_socket_addrs()
            .map_err(|e| StaterError::InvalidEndpoint(self.endpoint.clone(), e.to_string()))?
            .next()
            .ok_or_else(|| {
                StaterError::InvalidEndpoint(
                    self.endpoint.clone(),
                    "to_socket_addrs returned an empty iterator".to_string(),
                )
            })
    }
}

/// Builder for creating a [`StatsdSender`].
pub struct StatsdBuilder {
    endpoint: Option<String>,
    buffer_size: usize,
    reconnect_interval: Duration,
    write_timeout: Duration,
    queue_full: QueueFullPolicy,
    line_ending: LineEnding,
    prefix: Option<String>,
    global_tags: Option<IndexMap<String, String>>,
    sample_rate_precision: usize,
}

impl StatsdBuilder {
    /// Creates a new [`StatsdBuilder`].
    pub fn new() -> Self {
        Self {
            endpoint: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            queue_full: QueueFullPolicy::default(),
            line_ending: LineEnding::default(),
            prefix: None,
            global_tags: None,
            sample_rate_precision: DEFAULT_SAMPLE_RATE_PRECISION,
        }
    }

    /// Sets the `host:port` of the statsd server stats are sent to.
    ///
    /// The address is resolved when the sender is initialized, and again on every reconnect, so
    /// DNS changes are picked up.
    #[must_use]
    pub fn with_endpoint<E>(mut self, endpoint: E) -> Self
    where
        E: Into<String>,
    {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets how many formatted stats can wait to be sent.
    ///
    /// Defaults to 1024.
    ///
    /// ## Errors
    ///
    /// If `size` is zero, an error variant will be returned.
    pub fn set_buffer_size(mut self, size: usize) -> Result<Self, StaterError> {
        if size == 0 {
            return Err(StaterError::EmptyBuffer);
        }
        self.buffer_size = size;
        Ok(self)
    }

    /// Sets the minimum time between two reconnect attempts.
    ///
    /// Defaults to one second.
    #[must_use]
    pub fn set_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Sets how long a single datagram write may take before the connection is considered
    /// broken.
    ///
    /// Defaults to 100ms.
    #[must_use]
    pub fn set_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets what happens to a stat when the send buffer is full.
    ///
    /// Defaults to waiting up to 10ms before dropping it.
    #[must_use]
    pub fn set_queue_full_policy(mut self, policy: QueueFullPolicy) -> Self {
        self.queue_full = policy;
        self
    }

    /// Sets the terminator appended to every line. Defaults to `\n`.
    #[must_use]
    pub fn set_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    /// Sets how many decimals are used when rendering sample rates. Defaults to 6.
    #[must_use]
    pub fn set_sample_rate_precision(mut self, precision: usize) -> Self {
        self.sample_rate_precision = precision;
        self
    }

    /// Adds a global tag, sent with every stat using the dogstatsd `|#key:value` extension.
    ///
    /// If this method is called multiple times, the latest value for a given key will be used.
    #[must_use]
    pub fn add_global_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let tags = self.global_tags.get_or_insert_with(IndexMap::new);
        tags.insert(key.into(), value.into());
        self
    }

    /// Adds a global prefix for every stat name, separated from it by a period.
    #[must_use]
    pub fn set_global_prefix<P>(mut self, prefix: P) -> Self
    where
        P: Into<String>,
    {
        self.prefix = Some(prefix.into());
        self
    }

    /// Builds the sender. Nothing is resolved or connected until [`StatsdSender::init`].
    ///
    /// ## Errors
    ///
    /// If no endpoint was configured, an error variant will be returned.
    pub fn build(self) -> Result<StatsdSender, StaterError> {
        Ok(StatsdSender::from_config(self.build_config()?))
    }

    pub(crate) fn build_config(self) -> Result<SenderConfig, StaterError> {
        let endpoint = self.endpoint.ok_or(StaterError::MissingEndpoint)?;
        Ok(SenderConfig {
            endpoint,
            buffer_size: self.buffer_size,
            reconnect_interval: self.reconnect_interval,
            write_timeout: self.write_timeout,
            queue_full: self.queue_full,
            line_ending: self.line_ending,
            prefix: self.prefix,
            global_tags: self
                .global_tags
                .as_ref()
                .map(render_tags)
                .unwrap_or_default(),
            sample_rate_precision: self.sample_rate_precision,
        })
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder::new()
    }
}
