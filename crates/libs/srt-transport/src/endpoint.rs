//! SRT endpoint
//!
//! Owns one SRT socket and its supervising monitor thread. The same type
//! serves both directions of the bridge: a sender pushes MPEG-TS to a remote
//! target, a listener accepts one caller at a time and hands the received
//! chunks to a [`ChunkSink`].

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::api::{ConnectionState, PollId, SocketId, TransportError};
use crate::library::SrtLibrary;
use crate::monitor;
use crate::stats::{EndpointStats, EndpointStatsSnapshot};

/// Transport chunk size: seven 188-byte TS packets per SRT message
pub const TS_CHUNK_SIZE: usize = 1316;

/// Monitor poll cadence
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Endpoint errors
#[derive(Debug, thiserror::Error)]
pub enum SrtError {
    #[error("endpoint is already open")]
    AlreadyOpen,

    #[error("endpoint is not open")]
    NotOpen,

    #[error("endpoint already holds a live socket")]
    AlreadyConnected,

    #[error("cannot resolve '{0}' to an IPv4 address")]
    UnresolvedAddress(String),

    #[error("new socket reported state '{0}' instead of 'init'")]
    BadInitialState(ConnectionState),

    #[error("failed to start SRT library: {0}")]
    Library(#[source] TransportError),

    #[error("{op} failed: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("failed to spawn monitor thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl SrtError {
    fn transport(op: &'static str) -> impl FnOnce(TransportError) -> SrtError {
        move |source| SrtError::Transport { op, source }
    }
}

/// Which side of the bridge the endpoint serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connects out to a target and writes
    Sender,

    /// Binds, listens and reads from one caller at a time
    Listener,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Listener => f.write_str("listener"),
        }
    }
}

/// Endpoint tuning
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Monitor cadence; also bounds how long `close` waits for the thread
    pub poll_interval: Duration,

    /// SRT receiver latency applied to new sockets
    pub latency_ms: Option<u32>,

    /// Listen backlog
    pub backlog: i32,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            latency_ms: None,
            backlog: 1,
        }
    }
}

/// Result of [`SrtEndpoint::write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Chunks were handed to the transport; `bytes` counts only the chunks
    /// that succeeded
    Sent {
        bytes: usize,
        chunks: usize,
        failed_chunks: usize,
    },

    /// No connected socket; the whole payload was discarded
    Dropped { bytes: usize },
}

impl WriteOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, WriteOutcome::Dropped { .. })
    }
}

/// Lifecycle of the monitor thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorStatus {
    /// Not started yet
    Idle,

    Running,

    /// Exited after a stop request
    Stopped,

    /// Exited on a fatal error; the session must be restarted
    Failed(String),
}

/// Receiver of chunks read by a listener endpoint
///
/// Called from the monitor thread, so implementations must only hand data
/// off and never block.
pub trait ChunkSink: Send + Sync {
    /// A caller was accepted; chunks that follow come from `peer`
    fn caller(&self, _peer: SocketAddrV4) {}

    /// One non-empty chunk read from the current caller
    fn chunk(&self, data: Bytes);

    /// The current caller is gone; partial downstream state must be flushed
    fn reset(&self);
}

pub(crate) enum Mode {
    Sender,
    Listener(Arc<dyn ChunkSink>),
}

impl Mode {
    fn role(&self) -> Role {
        match self {
            Mode::Sender => Role::Sender,
            Mode::Listener(_) => Role::Listener,
        }
    }
}

/// A live socket with its notification set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) socket: SocketId,
    pub(crate) poll: PollId,
}

/// State guarded by the endpoint lock
#[derive(Debug, Default)]
pub(crate) struct Inner {
    pub(crate) addr: Option<SocketAddrV4>,
    pub(crate) link: Option<Link>,
}

/// Everything the endpoint shares with its monitor thread
pub(crate) struct Shared {
    pub(crate) library: Arc<SrtLibrary>,
    pub(crate) mode: Mode,
    pub(crate) options: EndpointOptions,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) stats: EndpointStats,
    stop: AtomicBool,
    status: Mutex<MonitorStatus>,
}

impl Shared {
    pub(crate) fn role(&self) -> Role {
        self.mode.role()
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn set_status(&self, status: MonitorStatus) {
        *self.status.lock() = status;
    }

    /// Poll set of the current link, if any
    pub(crate) fn current_poll(&self) -> Option<PollId> {
        self.inner.lock().link.map(|link| link.poll)
    }

    /// Install a fresh socket; the caller holds the endpoint lock
    pub(crate) fn connect_locked(&self, inner: &mut Inner) -> Result<(), SrtError> {
        let addr = inner.addr.ok_or(SrtError::NotOpen)?;
        if inner.link.is_some() {
            return Err(SrtError::AlreadyConnected);
        }

        let link = self.establish(addr)?;
        tracing::debug!(
            role = %self.role(),
            addr = %addr,
            socket = link.socket,
            "SRT socket installed"
        );
        inner.link = Some(link);
        Ok(())
    }

    /// Close the live socket, if any; the caller holds the endpoint lock
    pub(crate) fn disconnect_locked(&self, inner: &mut Inner) {
        if let Some(link) = inner.link.take() {
            let api = self.library.api();
            api.poll_remove(link.poll, link.socket);
            api.poll_release(link.poll);
            api.close(link.socket);
            tracing::debug!(role = %self.role(), socket = link.socket, "SRT socket closed");
        }
    }

    fn establish(&self, addr: SocketAddrV4) -> Result<Link, SrtError> {
        let api = self.library.api();
        let socket = api
            .create_socket()
            .map_err(SrtError::transport("create socket"))?;

        let mut poll = None;
        match self.configure(socket, addr, &mut poll) {
            Ok(poll) => Ok(Link { socket, poll }),
            Err(e) => {
                if let Some(poll) = poll {
                    api.poll_release(poll);
                }
                api.close(socket);
                Err(e)
            }
        }
    }

    fn configure(
        &self,
        socket: SocketId,
        addr: SocketAddrV4,
        poll: &mut Option<PollId>,
    ) -> Result<PollId, SrtError> {
        let api = self.library.api();
        api.set_send_blocking(socket, false)
            .map_err(SrtError::transport("set non-blocking send"))?;
        api.set_recv_blocking(socket, false)
            .map_err(SrtError::transport("set non-blocking receive"))?;
        if let Some(latency) = self.options.latency_ms {
            api.set_latency(socket, latency)
                .map_err(SrtError::transport("set latency"))?;
        }

        let state = api.state(socket);
        if state != ConnectionState::Init {
            return Err(SrtError::BadInitialState(state));
        }

        match self.mode {
            Mode::Sender => api
                .connect(socket, addr)
                .map_err(SrtError::transport("connect"))?,
            Mode::Listener(_) => {
                api.bind(socket, addr).map_err(SrtError::transport("bind"))?;
                api.listen(socket, self.options.backlog)
                    .map_err(SrtError::transport("listen"))?;
            }
        }

        let id = api
            .poll_create()
            .map_err(SrtError::transport("create poll"))?;
        *poll = Some(id);
        api.poll_add(id, socket)
            .map_err(SrtError::transport("add socket to poll"))?;
        Ok(id)
    }
}

/// One managed SRT socket plus its monitor thread
pub struct SrtEndpoint {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    library_held: AtomicBool,
}

impl SrtEndpoint {
    /// Endpoint that connects to a target and writes to it
    pub fn sender(library: Arc<SrtLibrary>, options: EndpointOptions) -> Self {
        Self::with_mode(library, options, Mode::Sender)
    }

    /// Endpoint that accepts callers and forwards what they send to `sink`
    pub fn listener(
        library: Arc<SrtLibrary>,
        options: EndpointOptions,
        sink: Arc<dyn ChunkSink>,
    ) -> Self {
        Self::with_mode(library, options, Mode::Listener(sink))
    }

    fn with_mode(library: Arc<SrtLibrary>, options: EndpointOptions, mode: Mode) -> Self {
        Self {
            shared: Arc::new(Shared {
                library,
                mode,
                options,
                inner: Mutex::new(Inner::default()),
                stats: EndpointStats::new(),
                stop: AtomicBool::new(false),
                status: Mutex::new(MonitorStatus::Idle),
            }),
            monitor: Mutex::new(None),
            library_held: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role()
    }

    /// Resolve `address` (`host:port`) and start the monitor thread
    pub fn open(&self, address: &str) -> Result<(), SrtError> {
        let mut monitor = self.monitor.lock();
        {
            let inner = self.shared.inner.lock();
            if inner.addr.is_some() || monitor.is_some() {
                return Err(SrtError::AlreadyOpen);
            }
        }

        self.shared.library.acquire().map_err(SrtError::Library)?;
        self.library_held.store(true, Ordering::Release);

        let addr = match resolve(address) {
            Ok(addr) => addr,
            Err(e) => {
                self.release_library();
                return Err(e);
            }
        };

        self.shared.inner.lock().addr = Some(addr);
        self.shared.stop.store(false, Ordering::Release);

        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("srt-{}", self.role()))
            .spawn(move || monitor::run(shared));
        match spawned {
            Ok(handle) => *monitor = Some(handle),
            Err(e) => {
                self.shared.inner.lock().addr = None;
                self.release_library();
                return Err(SrtError::Spawn(e));
            }
        }

        tracing::info!(role = %self.role(), addr = %addr, "SRT endpoint opened");
        Ok(())
    }

    /// Create the socket and connect (sender) or bind and listen (listener)
    pub fn connect(&self) -> Result<(), SrtError> {
        let mut inner = self.shared.inner.lock();
        self.shared.connect_locked(&mut inner)
    }

    /// Close the live socket; the monitor leaves the endpoint parked until
    /// the next `connect`
    pub fn disconnect(&self) {
        let mut inner = self.shared.inner.lock();
        self.shared.disconnect_locked(&mut inner);
    }

    /// Send `data` in [`TS_CHUNK_SIZE`] chunks
    ///
    /// Never blocks on the link: without a connected socket the payload is
    /// dropped and counted. A failing chunk is logged and the remaining
    /// chunks are still sent.
    pub fn write(&self, data: &[u8]) -> WriteOutcome {
        let inner = self.shared.inner.lock();
        let api = self.shared.library.api();

        let socket = match inner.link {
            Some(link) if api.state(link.socket) == ConnectionState::Connected => link.socket,
            _ => {
                self.shared.stats.write_dropped(data.len());
                return WriteOutcome::Dropped { bytes: data.len() };
            }
        };

        let mut bytes = 0;
        let mut chunks = 0;
        let mut failed_chunks = 0;
        for chunk in data.chunks(TS_CHUNK_SIZE) {
            chunks += 1;
            match api.send(socket, chunk) {
                Ok(sent) => {
                    bytes += sent;
                    self.shared.stats.chunk_sent(sent);
                }
                Err(e) => {
                    failed_chunks += 1;
                    self.shared.stats.chunk_failed();
                    tracing::warn!(
                        socket,
                        chunk = chunks - 1,
                        len = chunk.len(),
                        error = %e,
                        "SRT chunk send failed"
                    );
                }
            }
        }

        WriteOutcome::Sent {
            bytes,
            chunks,
            failed_chunks,
        }
    }

    /// Stop the monitor, close the socket and release the library
    ///
    /// Safe to call more than once and concurrently with `write`.
    pub fn close(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.monitor.lock().take() {
            if handle.join().is_err() {
                tracing::error!(role = %self.role(), "SRT monitor thread panicked");
                self.shared
                    .set_status(MonitorStatus::Failed("monitor thread panicked".to_string()));
            }
        }

        let addr = {
            let mut inner = self.shared.inner.lock();
            self.shared.disconnect_locked(&mut inner);
            inner.addr.take()
        };

        if self.release_library() {
            tracing::info!(
                role = %self.role(),
                addr = ?addr,
                "SRT endpoint closed"
            );
        }
    }

    fn release_library(&self) -> bool {
        if self.library_held.swap(false, Ordering::AcqRel) {
            self.shared.library.release();
            true
        } else {
            false
        }
    }

    /// Transport state of the live socket, `NonExistent` without one
    pub fn state(&self) -> ConnectionState {
        let inner = self.shared.inner.lock();
        match inner.link {
            Some(link) => self.shared.library.api().state(link.socket),
            None => ConnectionState::NonExistent,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Resolved address while open
    pub fn address(&self) -> Option<SocketAddrV4> {
        self.shared.inner.lock().addr
    }

    pub fn monitor_status(&self) -> MonitorStatus {
        self.shared.status.lock().clone()
    }

    pub fn stats(&self) -> EndpointStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

impl Drop for SrtEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SrtEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtEndpoint")
            .field("role", &self.role())
            .field("address", &self.address())
            .field("monitor", &self.monitor_status())
            .finish()
    }
}

/// First IPv4 address `address` resolves to
fn resolve(address: &str) -> Result<SocketAddrV4, SrtError> {
    let unresolved = || SrtError::UnresolvedAddress(address.to_string());
    address
        .to_socket_addrs()
        .map_err(|_| unresolved())?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSrt;

    fn sender(mock: &Arc<MockSrt>) -> SrtEndpoint {
        SrtEndpoint::sender(SrtLibrary::new(mock.clone()), EndpointOptions::default())
    }

    #[test]
    fn test_resolve_picks_ipv4() {
        let addr = resolve("127.0.0.1:9000").unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());

        assert!(matches!(
            resolve("[::1]:9000"),
            Err(SrtError::UnresolvedAddress(_))
        ));
        assert!(matches!(
            resolve("no-port-here"),
            Err(SrtError::UnresolvedAddress(_))
        ));
    }

    #[test]
    fn test_open_twice_fails() {
        let mock = MockSrt::new();
        let endpoint = sender(&mock);
        endpoint.open("127.0.0.1:9000").unwrap();
        assert!(matches!(
            endpoint.open("127.0.0.1:9000"),
            Err(SrtError::AlreadyOpen)
        ));
        endpoint.close();
    }

    #[test]
    fn test_unresolved_open_releases_library() {
        let mock = MockSrt::new();
        let library = SrtLibrary::new(mock.clone());
        let endpoint = SrtEndpoint::sender(library.clone(), EndpointOptions::default());

        assert!(matches!(
            endpoint.open("[::1]:9000"),
            Err(SrtError::UnresolvedAddress(_))
        ));
        assert_eq!(library.users(), 0);
        assert_eq!(mock.cleanups(), 1);
        assert_eq!(endpoint.monitor_status(), MonitorStatus::Idle);
    }

    #[test]
    fn test_connect_requires_open() {
        let mock = MockSrt::new();
        let endpoint = sender(&mock);
        assert!(matches!(endpoint.connect(), Err(SrtError::NotOpen)));
    }

    #[test]
    fn test_connect_twice_fails() {
        let mock = MockSrt::new();
        let endpoint = sender(&mock);
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();

        assert!(endpoint.is_connected());
        assert!(matches!(
            endpoint.connect(),
            Err(SrtError::AlreadyConnected)
        ));
        assert_eq!(mock.created_sockets().len(), 1);
    }

    #[test]
    fn test_connect_configures_socket() {
        let mock = MockSrt::new();
        let options = EndpointOptions {
            latency_ms: Some(120),
            ..Default::default()
        };
        let endpoint = SrtEndpoint::sender(SrtLibrary::new(mock.clone()), options);
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();

        let socket = mock.last_socket().unwrap();
        assert!(!mock.is_send_blocking(socket));
        assert!(!mock.is_recv_blocking(socket));
        assert_eq!(mock.latency(socket), Some(120));
        assert_eq!(mock.peer(socket), Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn test_bad_initial_state_cleans_up() {
        let mock = MockSrt::new();
        mock.set_initial_state(ConnectionState::Opened);
        let endpoint = sender(&mock);
        endpoint.open("127.0.0.1:9000").unwrap();

        assert!(matches!(
            endpoint.connect(),
            Err(SrtError::BadInitialState(ConnectionState::Opened))
        ));
        assert_eq!(endpoint.state(), ConnectionState::NonExistent);
        assert_eq!(mock.open_sockets(), 0);
        assert_eq!(mock.open_polls(), 0);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mock = MockSrt::new();
        let endpoint = sender(&mock);
        endpoint.disconnect();

        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();
        endpoint.disconnect();
        endpoint.disconnect();

        assert_eq!(endpoint.state(), ConnectionState::NonExistent);
        assert_eq!(mock.open_sockets(), 0);
        assert_eq!(mock.open_polls(), 0);
    }

    #[test]
    fn test_write_without_connection_is_dropped() {
        let mock = MockSrt::new();
        let endpoint = sender(&mock);

        assert_eq!(
            endpoint.write(&[0u8; 3000]),
            WriteOutcome::Dropped { bytes: 3000 }
        );

        endpoint.open("127.0.0.1:9000").unwrap();
        assert!(endpoint.write(&[0u8; 10]).is_dropped());

        let stats = endpoint.stats();
        assert_eq!(stats.writes_dropped, 2);
        assert_eq!(stats.bytes_dropped, 3010);
        assert_eq!(mock.send_attempts(), 0);
    }

    #[test]
    fn test_write_while_connecting_is_dropped() {
        let mock = MockSrt::new();
        mock.set_connect_state(ConnectionState::Connecting);
        let endpoint = sender(&mock);
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();

        assert_eq!(endpoint.write(&[1u8; 188]), WriteOutcome::Dropped { bytes: 188 });
    }

    #[test]
    fn test_write_splits_into_chunks() {
        let mock = MockSrt::new();
        let endpoint = sender(&mock);
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();

        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        assert_eq!(
            endpoint.write(&data),
            WriteOutcome::Sent {
                bytes: 3000,
                chunks: 3,
                failed_chunks: 0
            }
        );

        let sent = mock.sent();
        assert_eq!(
            sent.iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![1316, 1316, 368]
        );
        assert_eq!(sent.concat(), data);
    }

    #[test]
    fn test_failed_chunk_does_not_abort_write() {
        let mock = MockSrt::new();
        mock.fail_send_attempt(1);
        let endpoint = sender(&mock);
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();

        assert_eq!(
            endpoint.write(&[7u8; 3000]),
            WriteOutcome::Sent {
                bytes: 1316 + 368,
                chunks: 3,
                failed_chunks: 1
            }
        );
        assert_eq!(mock.send_attempts(), 3);

        let stats = endpoint.stats();
        assert_eq!(stats.chunks_sent, 2);
        assert_eq!(stats.chunk_errors, 1);
    }

    #[test]
    fn test_close_is_idempotent_and_releases_library() {
        let mock = MockSrt::new();
        let library = SrtLibrary::new(mock.clone());
        let first = SrtEndpoint::sender(library.clone(), EndpointOptions::default());
        let second = SrtEndpoint::sender(library.clone(), EndpointOptions::default());

        first.open("127.0.0.1:9000").unwrap();
        second.open("127.0.0.1:9001").unwrap();
        first.connect().unwrap();
        assert_eq!(mock.startups(), 1);
        assert_eq!(library.users(), 2);

        first.close();
        first.close();
        assert_eq!(library.users(), 1);
        assert_eq!(mock.cleanups(), 0);
        assert_eq!(first.monitor_status(), MonitorStatus::Stopped);
        assert_eq!(first.state(), ConnectionState::NonExistent);
        assert_eq!(first.address(), None);

        drop(second);
        assert_eq!(library.users(), 0);
        assert_eq!(mock.cleanups(), 1);
    }

    #[test]
    fn test_reopen_after_close() {
        let mock = MockSrt::new();
        let endpoint = sender(&mock);
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.close();

        endpoint.open("127.0.0.1:9001").unwrap();
        endpoint.connect().unwrap();
        assert_eq!(endpoint.address(), Some("127.0.0.1:9001".parse().unwrap()));
        assert!(endpoint.is_connected());
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]

        #[test]
        fn prop_write_attempts_every_chunk(
            len in 0usize..10_000,
            failing in proptest::collection::hash_set(0usize..8, 0..4),
        ) {
            let mock = MockSrt::new();
            for n in &failing {
                mock.fail_send_attempt(*n);
            }
            let options = EndpointOptions {
                poll_interval: Duration::from_millis(1),
                ..Default::default()
            };
            let endpoint = SrtEndpoint::sender(SrtLibrary::new(mock.clone()), options);
            endpoint.open("127.0.0.1:9000").unwrap();
            endpoint.connect().unwrap();

            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let expected_chunks = len.div_ceil(TS_CHUNK_SIZE);
            let expected_failures = failing.iter().filter(|n| **n < expected_chunks).count();

            match endpoint.write(&data) {
                WriteOutcome::Sent { bytes, chunks, failed_chunks } => {
                    proptest::prop_assert_eq!(chunks, expected_chunks);
                    proptest::prop_assert_eq!(failed_chunks, expected_failures);
                    proptest::prop_assert_eq!(mock.send_attempts(), expected_chunks);
                    proptest::prop_assert!(mock.sent().iter().all(|c| c.len() <= TS_CHUNK_SIZE));
                    proptest::prop_assert_eq!(bytes, mock.sent().iter().map(|c| c.len()).sum::<usize>());
                }
                WriteOutcome::Dropped { .. } => proptest::prop_assert!(false, "connected write dropped"),
            }
            endpoint.close();
        }
    }

    #[test]
    fn test_listener_binds_and_listens() {
        struct NullSink;
        impl ChunkSink for NullSink {
            fn chunk(&self, _data: Bytes) {}
            fn reset(&self) {}
        }

        let mock = MockSrt::new();
        let endpoint = SrtEndpoint::listener(
            SrtLibrary::new(mock.clone()),
            EndpointOptions::default(),
            Arc::new(NullSink),
        );
        endpoint.open("0.0.0.0:1234").unwrap();
        endpoint.connect().unwrap();

        assert_eq!(endpoint.role(), Role::Listener);
        assert_eq!(endpoint.state(), ConnectionState::Listening);
        assert!(endpoint.write(&[0u8; 188]).is_dropped());
    }

    #[test]
    fn test_bind_failure_leaves_endpoint_clean() {
        struct NullSink;
        impl ChunkSink for NullSink {
            fn chunk(&self, _data: Bytes) {}
            fn reset(&self) {}
        }

        let mock = MockSrt::new();
        mock.refuse_bind();
        let endpoint = SrtEndpoint::listener(
            SrtLibrary::new(mock.clone()),
            EndpointOptions::default(),
            Arc::new(NullSink),
        );
        endpoint.open("0.0.0.0:1234").unwrap();

        assert!(matches!(
            endpoint.connect(),
            Err(SrtError::Transport { op: "bind", .. })
        ));
        assert_eq!(endpoint.state(), ConnectionState::NonExistent);
        assert_eq!(mock.open_sockets(), 0);
    }
}
