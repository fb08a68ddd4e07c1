//! The statsd UDP sender.
//!
//! Stats are formatted on the calling thread and pushed onto a bounded queue. A single
//! background task drains the queue and writes one datagram per stat to a connected UDP socket.
//! Write failures never reach the caller: they schedule a reconnect through a [`Governor`], so a
//! burst of failures results in at most one reconnect attempt per reconnect interval.

use std::fmt::Display;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use portable_atomic::AtomicU64;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::builder::SenderConfig;
use crate::common::{QueueFullPolicy, StaterError};
use crate::formatting::MetricKind;
use crate::governor::Governor;
use crate::runtime::Executor;
use crate::sampler::can_sample;
use crate::stater::Stater;

/// Lower bound on how often an idle, disconnected transmission task retries reconnecting.
const MIN_IDLE_CHECK: Duration = Duration::from_millis(10);

pub(crate) struct Inner {
    config: SenderConfig,
    /// Set between a successful `init` and `shutdown`. Stats are only accepted while set.
    active: AtomicBool,
    queue: RwLock<Option<Sender<String>>>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    executor: Mutex<Option<Executor>>,
    reconnect: Governor,
    dropped: AtomicU64,
    reconnects: AtomicU64,
}

impl Inner {
    fn send<T: Display>(&self, kind: MetricKind, key: &str, value: T, rate: f32) {
        if !self.active.load(Ordering::Acquire) || !can_sample(rate) {
            return;
        }

        let line = self.config.format(kind, key, value, rate);

        let queue = self.queue.read().clone();
        let Some(queue) = queue else {
            return;
        };
        if !enqueue(&queue, line, self.config.queue_full) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn handle(&self) -> Option<Handle> {
        self.executor.lock().as_ref().map(|e| e.handle().clone())
    }

    /// Resolves the endpoint and opens a socket connected to it.
    fn connect(&self, handle: &Handle) -> Result<UdpSocket, StaterError> {
        let endpoint = self.config.resolve_endpoint()?;
        let connect_err = |source| StaterError::Connect {
            endpoint: self.config.endpoint.clone(),
            source,
        };

        let bind_addr: SocketAddr = if endpoint.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = std::net::UdpSocket::bind(bind_addr).map_err(connect_err)?;
        socket.connect(endpoint).map_err(connect_err)?;
        socket.set_nonblocking(true).map_err(connect_err)?;

        let socket = {
            let _g = handle.enter();
            UdpSocket::from_std(socket).map_err(connect_err)?
        };

        debug!(%endpoint, "opened statsd connection");
        Ok(socket)
    }

    /// Swaps in a reconnected socket, unless the sender was shut down in the meantime.
    ///
    /// `shutdown` clears `active` before taking the socket lock, so checking it under that lock
    /// means no socket outlives a shutdown.
    fn install(&self, socket: UdpSocket) -> bool {
        let mut slot = self.socket.write();
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        *slot = Some(Arc::new(socket));
        true
    }

    fn disconnect(&self) {
        if self.socket.write().take().is_some() {
            debug!(endpoint = %self.config.endpoint, "closed statsd connection");
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.read().is_some()
    }

    /// Tears the connection down and opens a new one. Run by the reconnect governor.
    fn reconnect_now(&self) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let Some(handle) = self.handle() else {
            return;
        };

        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.disconnect();
        match self.connect(&handle) {
            Ok(socket) => {
                if self.install(socket) {
                    info!(endpoint = %self.config.endpoint, "reconnected to statsd");
                } else {
                    debug!("sender shut down while reconnecting, closing new connection");
                }
            }
            Err(e) => error!(error = %e, "failed to reconnect to statsd"),
        }
    }

    /// Schedules a governed reconnect on the blocking pool so the caller never waits for it.
    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.reconnect.is_ready() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::task::spawn_blocking(move || inner.reconnect.call());
    }

    async fn write(self: &Arc<Self>, line: &str) {
        let socket = self.socket.read().clone();
        let Some(socket) = socket else {
            debug!(stat = ?line, "no statsd connection, dropping stat");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.schedule_reconnect();
            return;
        };

        match tokio::time::timeout(self.config.write_timeout, socket.send(line.as_bytes())).await {
            Ok(Ok(sent)) if sent == line.len() => {}
            Ok(Ok(sent)) => {
                error!(
                    "Somehow this UDP socket sent less bytes ({}) than it was asked ({})",
                    sent,
                    line.len()
                );
                self.schedule_reconnect();
            }
            Ok(Err(e)) => {
                error!(error = %e, stat = ?line, "failed to write to statsd connection");
                self.schedule_reconnect();
            }
            Err(_) => {
                warn!(stat = ?line, "timed out writing to statsd connection");
                self.schedule_reconnect();
            }
        }
    }
}

/// Puts a line on the queue according to `policy`. Returns false if the line was dropped.
pub(crate) fn enqueue(queue: &Sender<String>, line: String, policy: QueueFullPolicy) -> bool {
    let result = match policy {
        QueueFullPolicy::Drop => queue.try_send(line).map_err(|e| match e {
            TrySendError::Full(line) | TrySendError::Disconnected(line) => line,
        }),
        QueueFullPolicy::Wait(timeout) => queue
            .send_timeout(line, timeout)
            .map_err(|e| e.into_inner()),
    };

    match result {
        Ok(()) => true,
        Err(line) => {
            debug!(stat = ?line, "statsd send buffer full, dropping stat");
            false
        }
    }
}

/// Drains the queue until it is closed.
///
/// Holds only a weak reference so a sender that is dropped without `shutdown` still stops it.
async fn transmit(inner: Weak<Inner>, queue: Receiver<String>, idle: Duration) {
    loop {
        let line = match tokio::time::timeout(idle, queue.recv_async()).await {
            Ok(Ok(line)) => Some(line),
            Ok(Err(_)) => break,
            Err(_) => None,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        match line {
            Some(line) => inner.write(&line).await,
            // nothing to send, but make sure a failed reconnect gets retried
            None if !inner.is_connected() => inner.schedule_reconnect(),
            None => {}
        }
    }
    debug!("statsd transmission loop stopped");
}

/// A [`Stater`] that ships stats to a statsd server over UDP.
///
/// Cloning is cheap and clones share the same connection.
///
/// Stats are dropped silently while the sender isn't initialized, when they are sampled out, and
/// when the send buffer stays full for longer than the queue-full policy allows. Timers are sent
/// in whole milliseconds.
#[derive(Clone)]
pub struct StatsdSender {
    inner: Arc<Inner>,
}

impl StatsdSender {
    pub(crate) fn from_config(config: SenderConfig) -> Self {
        let reconnect_interval = config.reconnect_interval;
        StatsdSender {
            inner: Arc::new(Inner {
                config,
                active: AtomicBool::new(false),
                queue: RwLock::new(None),
                socket: RwLock::new(None),
                executor: Mutex::new(None),
                reconnect: Governor::new(reconnect_interval, || {}),
                dropped: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Number of stats that were accepted but never made it onto the wire.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Number of reconnects performed since the sender was created.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::Relaxed)
    }

    /// Tears down the connection and opens a new one, at most once per reconnect interval.
    ///
    /// The thread that ends up reconnecting also waits out the rest of the interval, so avoid
    /// calling this from async code.
    pub fn reconnect(&self) {
        self.inner.reconnect.call();
    }
}

impl Stater for StatsdSender {
    fn timer(&self, key: &str, value: Duration, rate: f32) {
        self.inner
            .send(MetricKind::Timer, key, value.as_millis(), rate);
    }

    fn gauge(&self, key: &str, value: f64, rate: f32) {
        self.inner.send(MetricKind::Gauge, key, value, rate);
    }

    fn increment(&self, key: &str, value: i64, rate: f32) {
        self.inner.send(MetricKind::Counter, key, value, rate);
    }

    /// Resolves and connects to the endpoint and starts the transmission task.
    ///
    /// Calling it again while initialized does nothing.
    fn init(&self) -> Result<(), StaterError> {
        let inner = &self.inner;
        // held for the whole call so concurrent inits and shutdowns are serialized
        let mut slot = inner.executor.lock();
        if inner.active.load(Ordering::Acquire) {
            return Ok(());
        }

        let executor = Executor::acquire("stater-statsd")?;
        let handle = executor.handle().clone();
        let socket = inner.connect(&handle)?;
        *inner.socket.write() = Some(Arc::new(socket));

        // set up a reconnection function that tries to
        // reconnect to the statsd server at-most once
        // per interval
        let weak = Arc::downgrade(inner);
        inner
            .reconnect
            .set_interval(inner.config.reconnect_interval);
        inner.reconnect.set_func(move || {
            if let Some(inner) = weak.upgrade() {
                inner.reconnect_now();
            }
        });

        let (tx, rx) = flume::bounded(inner.config.buffer_size);
        let idle = inner.config.reconnect_interval.max(MIN_IDLE_CHECK);
        handle.spawn(transmit(Arc::downgrade(inner), rx, idle));

        *inner.queue.write() = Some(tx);
        *slot = Some(executor);
        inner.active.store(true, Ordering::Release);

        info!(endpoint = %inner.config.endpoint, "statsd sender initialized");
        Ok(())
    }

    fn shutdown(&self) {
        let inner = &self.inner;
        let mut slot = inner.executor.lock();
        inner.active.store(false, Ordering::Release);
        // dropping the queue's sender ends the transmission task
        inner.queue.write().take();
        inner.disconnect();
        let executor = slot.take();
        drop(slot);
        drop(executor);
        debug!(endpoint = %inner.config.endpoint, "statsd sender shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::enqueue;
    use crate::builder::StatsdBuilder;
    use crate::common::{QueueFullPolicy, StaterError};
    use crate::runtime::Executor;
    use crate::stater::Stater;
    use crate::StatsdSender;
    use std::net::UdpSocket;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    struct UdpTestServer {
        socket: UdpSocket,
    }

    impl UdpTestServer {
        fn new() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            UdpTestServer { socket }
        }

        fn addr(&self) -> String {
            self.socket.local_addr().unwrap().to_string()
        }

        fn assert(&self, expected: &str) {
            let mut buf = [0u8; 1024];
            let n = self
                .socket
                .recv(&mut buf)
                .unwrap_or_else(|e| panic!("expected {expected:?}, did not receive any value: {e}"));
            assert_eq!(std::str::from_utf8(&buf[..n]).unwrap(), expected);
        }
    }

    fn new_test_pair() -> (StatsdSender, UdpTestServer) {
        let server = UdpTestServer::new();
        let client = StatsdBuilder::new()
            .with_endpoint(server.addr())
            .build()
            .unwrap();
        client.init().unwrap();
        (client, server)
    }

    #[test]
    fn test_increment() {
        let (client, server) = new_test_pair();

        client.increment("test.inc", 1, 1.0);
        server.assert("test.inc:1|c\n");

        client.increment("test.inc1", -1, 1.0);
        server.assert("test.inc1:-1|c\n");

        client.increment("test.inc2", -5, 1.0);
        server.assert("test.inc2:-5|c\n");

        client.increment("test.inc3", 100, 1.0);
        server.assert("test.inc3:100|c\n");

        client.shutdown();
    }

    #[test]
    fn test_gauge() {
        let (client, server) = new_test_pair();

        client.gauge("test.gauge", 1.0, 1.0);
        server.assert("test.gauge:1|g\n");

        client.gauge("test.gauge1", 2.5, 1.0);
        server.assert("test.gauge1:2.5|g\n");

        client.shutdown();
    }

    #[test]
    fn test_timer() {
        let (client, server) = new_test_pair();

        client.timer("test.timer", Duration::from_millis(1), 1.0);
        server.assert("test.timer:1|ms\n");

        client.timer("test.timer1", Duration::from_millis(10), 1.0);
        server.assert("test.timer1:10|ms\n");

        client.timer("test.timer2", Duration::from_micros(100_900), 1.0);
        server.assert("test.timer2:100|ms\n");

        client.timer("test.timer3", Duration::from_secs(1), 1.0);
        server.assert("test.timer3:1000|ms\n");

        client.shutdown();
    }

    #[test]
    fn test_inactive_sender_drops_stats() {
        let server = UdpTestServer::new();
        server
            .socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let client = StatsdBuilder::new()
            .with_endpoint(server.addr())
            .build()
            .unwrap();

        // never initialized
        client.increment("test.inc", 1, 1.0);
        // shut down without init
        client.shutdown();
        client.increment("test.inc", 1, 1.0);

        let mut buf = [0u8; 64];
        assert!(server.socket.recv(&mut buf).is_err());
        assert!(!client.is_active());
    }

    #[test]
    fn test_shutdown_then_init_again() {
        let (client, server) = new_test_pair();
        client.shutdown();
        assert!(!client.is_active());

        client.init().unwrap();
        client.increment("test.again", 2, 1.0);
        server.assert("test.again:2|c\n");
        client.shutdown();
    }

    #[test]
    fn test_init_unresolvable_endpoint() {
        let client = StatsdBuilder::new()
            .with_endpoint("this is not an endpoint")
            .build()
            .unwrap();
        assert!(matches!(
            client.init(),
            Err(StaterError::InvalidEndpoint(..))
        ));
        assert!(!client.is_active());
        client.shutdown();
    }

    #[test]
    fn test_backpressure_drops_without_blocking() {
        let (tx, rx) = flume::bounded(1);
        let timeout = Duration::from_millis(20);

        let start = Instant::now();
        let accepted: Vec<bool> = (0..5)
            .map(|i| enqueue(&tx, format!("stat.{i}:1|c\n"), QueueFullPolicy::Wait(timeout)))
            .collect();
        let elapsed = start.elapsed();

        assert_eq!(accepted, [true, false, false, false, false]);
        assert!(elapsed < Duration::from_secs(1), "blocked for {elapsed:?}");
        assert_eq!(rx.try_recv().unwrap(), "stat.0:1|c\n");
        assert!(rx.try_recv().is_err());

        let start = Instant::now();
        assert!(!enqueue(&tx, "stat.x:1|c\n".to_string(), QueueFullPolicy::Drop));
        assert!(start.elapsed() < timeout);
    }

    #[test]
    fn test_full_buffer_drops_stats() {
        let server = UdpTestServer::new();
        let timeout = Duration::from_millis(20);
        let client = StatsdBuilder::new()
            .with_endpoint(server.addr())
            .set_buffer_size(1)
            .unwrap()
            .set_queue_full_policy(QueueFullPolicy::Wait(timeout))
            .build()
            .unwrap();

        // nothing drives this runtime until block_on, so the queue is never drained before then
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        {
            let _g = runtime.enter();
            client.init().unwrap();
        }

        for i in 0..5 {
            let start = Instant::now();
            client.increment(&format!("test.burst.{i}"), 1, 1.0);
            let elapsed = start.elapsed();
            assert!(elapsed < Duration::from_millis(500), "blocked for {elapsed:?}");
        }
        assert_eq!(client.dropped_count(), 4);

        runtime.block_on(async { tokio::time::sleep(Duration::from_millis(100)).await });
        server.assert("test.burst.0:1|c\n");
        server
            .socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut buf = [0u8; 64];
        assert!(server.socket.recv(&mut buf).is_err());

        client.shutdown();
    }

    #[test]
    fn test_names_sent_unchanged() {
        let (client, server) = new_test_pair();

        client.increment("5xx.http-errors", 1, 1.0);
        server.assert("5xx.http-errors:1|c\n");

        client.timer("api.GET/users", Duration::from_millis(3), 1.0);
        server.assert("api.GET/users:3|ms\n");

        client.gauge("bad:name|x", 1.0, 1.0);
        server.assert("bad_name_x:1|g\n");

        client.shutdown();
    }

    #[test]
    fn test_concurrent_init_starts_one_sender() {
        let server = UdpTestServer::new();
        let client = StatsdBuilder::new()
            .with_endpoint(server.addr())
            .build()
            .unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    client.init()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert!(client.is_active());

        for i in 0..3 {
            client.increment(&format!("test.once.{i}"), 1, 1.0);
            server.assert(&format!("test.once.{i}:1|c\n"));
        }

        client.shutdown();
    }

    #[test]
    fn test_no_connection_survives_shutdown() {
        let (client, _server) = new_test_pair();
        let executor = Executor::acquire("stater-test").unwrap();

        let socket = client.inner.connect(executor.handle()).unwrap();
        assert!(client.inner.install(socket));
        assert!(client.inner.is_connected());

        client.shutdown();
        assert!(!client.inner.is_connected());

        // a reconnect that finishes after shutdown must not leave its socket behind
        let socket = client.inner.connect(executor.handle()).unwrap();
        assert!(!client.inner.install(socket));
        assert!(!client.inner.is_connected());
    }

    #[test]
    fn test_reconnects_after_refused_writes() {
        // grab a free port and close it again so writes get refused
        let addr = UdpTestServer::new().addr();

        let client = StatsdBuilder::new()
            .with_endpoint(addr.clone())
            .set_reconnect_interval(Duration::from_millis(50))
            .build()
            .unwrap();
        client.init().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while client.reconnect_count() == 0 && Instant::now() < deadline {
            client.increment("test.refused", 1, 1.0);
            thread::sleep(Duration::from_millis(10));
        }
        assert!(client.reconnect_count() >= 1);
        assert!(client.is_active());

        // the destination comes back and stats flow again
        let server = UdpSocket::bind(&addr).unwrap();
        server
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut received = None;
        while received.is_none() && Instant::now() < deadline {
            client.increment("test.back", 1, 1.0);
            if let Ok(n) = server.recv(&mut buf) {
                received = Some(String::from_utf8_lossy(&buf[..n]).into_owned());
            }
        }
        assert!(received.unwrap().starts_with("test."));

        client.shutdown();
    }
}
