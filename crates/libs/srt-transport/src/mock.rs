//! Scripted in-memory SRT transport
//!
//! Behaves like a loopback libsrt: senders connect instantly, listeners
//! accept queued clients, and clients replay a scripted list of inbound
//! chunks and errors. Tests flip socket states to simulate link loss.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::api::{ConnectionState, PollId, SocketId, SrtApi, TransportError};

/// One scripted receive result for an accepted client
#[derive(Debug, Clone)]
pub enum MockInbound {
    Data(Bytes),
    Error(TransportError),
}

#[derive(Debug)]
struct MockSocket {
    state: ConnectionState,
    recv_blocking: bool,
    send_blocking: bool,
    latency_ms: Option<u32>,
    inbound: VecDeque<MockInbound>,
    peer: Option<SocketAddrV4>,
    accepted: bool,
}

impl MockSocket {
    fn new(state: ConnectionState) -> Self {
        Self {
            state,
            recv_blocking: true,
            send_blocking: true,
            latency_ms: None,
            inbound: VecDeque::new(),
            peer: None,
            accepted: false,
        }
    }
}

#[derive(Debug)]
struct MockInner {
    next_socket: SocketId,
    next_poll: PollId,
    sockets: HashMap<SocketId, MockSocket>,
    polls: HashMap<PollId, HashSet<SocketId>>,
    created: Vec<SocketId>,
    startups: usize,
    cleanups: usize,
    fail_startup: bool,
    fail_create: bool,
    refuse_bind: bool,
    initial_state: ConnectionState,
    connect_state: ConnectionState,
    send_attempts: usize,
    poll_waits: usize,
    failing_sends: HashSet<usize>,
    sent: Vec<Bytes>,
    pending_clients: VecDeque<(SocketAddrV4, Vec<MockInbound>)>,
}

impl Default for MockInner {
    fn default() -> Self {
        Self {
            next_socket: 100,
            next_poll: 1,
            sockets: HashMap::new(),
            polls: HashMap::new(),
            created: Vec::new(),
            startups: 0,
            cleanups: 0,
            fail_startup: false,
            fail_create: false,
            refuse_bind: false,
            initial_state: ConnectionState::Init,
            connect_state: ConnectionState::Connected,
            send_attempts: 0,
            poll_waits: 0,
            failing_sends: HashSet::new(),
            sent: Vec::new(),
            pending_clients: VecDeque::new(),
        }
    }
}

impl MockInner {
    fn socket(&mut self, sock: SocketId) -> Result<&mut MockSocket, TransportError> {
        self.sockets.get_mut(&sock).ok_or(TransportError::Other {
            code: 5004,
            message: "invalid socket".to_string(),
        })
    }

    fn ready_count(&self, poll: PollId) -> Option<usize> {
        let watched = self.polls.get(&poll)?;
        let listening = watched.iter().any(|sock| {
            self.sockets
                .get(sock)
                .is_some_and(|s| s.state == ConnectionState::Listening)
        });
        let mut ready = watched
            .iter()
            .filter(|sock| match self.sockets.get(sock) {
                Some(s) => {
                    !s.inbound.is_empty()
                        || s.state.is_lost()
                        || s.state == ConnectionState::Closing
                }
                None => true,
            })
            .count();
        if listening && !self.pending_clients.is_empty() {
            ready += 1;
        }
        Some(ready)
    }
}

/// In-memory [`SrtApi`]
#[derive(Debug, Default)]
pub struct MockSrt {
    inner: Mutex<MockInner>,
}

impl MockSrt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn startups(&self) -> usize {
        self.inner.lock().startups
    }

    pub fn cleanups(&self) -> usize {
        self.inner.lock().cleanups
    }

    pub fn fail_startup(&self) {
        self.inner.lock().fail_startup = true;
    }

    /// Make every following `create_socket` fail
    pub fn fail_create(&self, fail: bool) {
        self.inner.lock().fail_create = fail;
    }

    pub fn refuse_bind(&self) {
        self.inner.lock().refuse_bind = true;
    }

    /// State reported by freshly created sockets
    pub fn set_initial_state(&self, state: ConnectionState) {
        self.inner.lock().initial_state = state;
    }

    /// State a sender socket enters after `connect`
    pub fn set_connect_state(&self, state: ConnectionState) {
        self.inner.lock().connect_state = state;
    }

    /// Force the state of one socket
    pub fn set_state(&self, sock: SocketId, state: ConnectionState) {
        if let Some(s) = self.inner.lock().sockets.get_mut(&sock) {
            s.state = state;
        }
    }

    /// Mark every connected socket as broken
    pub fn break_connected(&self) {
        for s in self.inner.lock().sockets.values_mut() {
            if s.state == ConnectionState::Connected {
                s.state = ConnectionState::Broken;
            }
        }
    }

    pub fn socket_state(&self, sock: SocketId) -> ConnectionState {
        self.inner
            .lock()
            .sockets
            .get(&sock)
            .map(|s| s.state)
            .unwrap_or(ConnectionState::NonExistent)
    }

    pub fn is_recv_blocking(&self, sock: SocketId) -> bool {
        self.inner
            .lock()
            .sockets
            .get(&sock)
            .is_some_and(|s| s.recv_blocking)
    }

    pub fn is_send_blocking(&self, sock: SocketId) -> bool {
        self.inner
            .lock()
            .sockets
            .get(&sock)
            .is_some_and(|s| s.send_blocking)
    }

    pub fn latency(&self, sock: SocketId) -> Option<u32> {
        self.inner
            .lock()
            .sockets
            .get(&sock)
            .and_then(|s| s.latency_ms)
    }

    /// Sockets in creation order
    pub fn created_sockets(&self) -> Vec<SocketId> {
        self.inner.lock().created.clone()
    }

    pub fn last_socket(&self) -> Option<SocketId> {
        self.inner.lock().created.last().copied()
    }

    /// Sockets that are neither closed nor released
    pub fn open_sockets(&self) -> usize {
        self.inner
            .lock()
            .sockets
            .values()
            .filter(|s| !s.state.is_lost())
            .count()
    }

    pub fn open_polls(&self) -> usize {
        self.inner.lock().polls.len()
    }

    /// Peer address a socket connected to
    pub fn peer(&self, sock: SocketId) -> Option<SocketAddrV4> {
        self.inner.lock().sockets.get(&sock).and_then(|s| s.peer)
    }

    /// Fail the `n`-th send attempt (zero-based, counted across all sockets)
    pub fn fail_send_attempt(&self, n: usize) {
        self.inner.lock().failing_sends.insert(n);
    }

    /// Number of `poll_wait` calls so far
    pub fn poll_waits(&self) -> usize {
        self.inner.lock().poll_waits
    }

    pub fn send_attempts(&self) -> usize {
        self.inner.lock().send_attempts
    }

    /// Payloads accepted by `send`, in order
    pub fn sent(&self) -> Vec<Bytes> {
        self.inner.lock().sent.clone()
    }

    /// Queue a caller for the listener; once accepted it replays `script`
    /// and then reports the connection as lost
    pub fn queue_client(&self, peer: SocketAddrV4, script: Vec<MockInbound>) {
        self.inner.lock().pending_clients.push_back((peer, script));
    }

    /// Append inbound data to an existing socket
    pub fn push_inbound(&self, sock: SocketId, item: MockInbound) {
        if let Some(s) = self.inner.lock().sockets.get_mut(&sock) {
            s.inbound.push_back(item);
        }
    }

    pub fn pending_inbound(&self, sock: SocketId) -> usize {
        self.inner
            .lock()
            .sockets
            .get(&sock)
            .map(|s| s.inbound.len())
            .unwrap_or(0)
    }
}

impl SrtApi for MockSrt {
    fn startup(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.fail_startup {
            return Err(TransportError::Other {
                code: -1,
                message: "startup refused".to_string(),
            });
        }
        inner.startups += 1;
        Ok(())
    }

    fn cleanup(&self) {
        self.inner.lock().cleanups += 1;
    }

    fn create_socket(&self) -> Result<SocketId, TransportError> {
        let mut inner = self.inner.lock();
        if inner.fail_create {
            return Err(TransportError::Other {
                code: 1001,
                message: "socket creation refused".to_string(),
            });
        }
        let sock = inner.next_socket;
        inner.next_socket += 1;
        let state = inner.initial_state;
        inner.sockets.insert(sock, MockSocket::new(state));
        inner.created.push(sock);
        Ok(sock)
    }

    fn close(&self, sock: SocketId) {
        let mut inner = self.inner.lock();
        if let Some(s) = inner.sockets.get_mut(&sock) {
            s.state = ConnectionState::Closed;
            s.inbound.clear();
        }
        for watched in inner.polls.values_mut() {
            watched.remove(&sock);
        }
    }

    fn state(&self, sock: SocketId) -> ConnectionState {
        self.socket_state(sock)
    }

    fn set_send_blocking(&self, sock: SocketId, blocking: bool) -> Result<(), TransportError> {
        self.inner.lock().socket(sock)?.send_blocking = blocking;
        Ok(())
    }

    fn set_recv_blocking(&self, sock: SocketId, blocking: bool) -> Result<(), TransportError> {
        self.inner.lock().socket(sock)?.recv_blocking = blocking;
        Ok(())
    }

    fn set_recv_timeout(&self, sock: SocketId, _timeout: Duration) -> Result<(), TransportError> {
        self.inner.lock().socket(sock).map(|_| ())
    }

    fn set_latency(&self, sock: SocketId, latency_ms: u32) -> Result<(), TransportError> {
        self.inner.lock().socket(sock)?.latency_ms = Some(latency_ms);
        Ok(())
    }

    fn connect(&self, sock: SocketId, addr: SocketAddrV4) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        let state = inner.connect_state;
        let s = inner.socket(sock)?;
        s.peer = Some(addr);
        s.state = state;
        Ok(())
    }

    fn bind(&self, sock: SocketId, _addr: SocketAddrV4) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.refuse_bind {
            return Err(TransportError::Other {
                code: 1003,
                message: "address already in use".to_string(),
            });
        }
        inner.socket(sock)?.state = ConnectionState::Opened;
        Ok(())
    }

    fn listen(&self, sock: SocketId, _backlog: i32) -> Result<(), TransportError> {
        self.inner.lock().socket(sock)?.state = ConnectionState::Listening;
        Ok(())
    }

    fn accept(&self, sock: SocketId) -> Result<(SocketId, SocketAddrV4), TransportError> {
        let mut inner = self.inner.lock();
        if inner.socket(sock)?.state != ConnectionState::Listening {
            return Err(TransportError::Other {
                code: 5005,
                message: "socket is not listening".to_string(),
            });
        }
        let (peer, script) = inner
            .pending_clients
            .pop_front()
            .ok_or(TransportError::WouldBlock)?;
        let client = inner.next_socket;
        inner.next_socket += 1;
        let mut socket = MockSocket::new(ConnectionState::Connected);
        socket.peer = Some(peer);
        socket.accepted = true;
        socket.inbound = script.into();
        inner.sockets.insert(client, socket);
        inner.created.push(client);
        Ok((client, peer))
    }

    fn send(&self, sock: SocketId, data: &[u8]) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock();
        let attempt = inner.send_attempts;
        inner.send_attempts += 1;
        if inner.socket(sock)?.state != ConnectionState::Connected {
            return Err(TransportError::ConnectionLost);
        }
        if inner.failing_sends.contains(&attempt) {
            return Err(TransportError::Other {
                code: 4001,
                message: "scripted send failure".to_string(),
            });
        }
        inner.sent.push(Bytes::copy_from_slice(data));
        Ok(data.len())
    }

    fn recv(&self, sock: SocketId, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock();
        let s = inner.socket(sock)?;
        match s.inbound.pop_front() {
            Some(MockInbound::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(MockInbound::Error(e)) => Err(e),
            None if s.state == ConnectionState::Connected && s.accepted => {
                // An accepted client whose script ran out hangs up
                s.state = ConnectionState::Broken;
                Err(TransportError::ConnectionLost)
            }
            None if s.state.is_lost() => Err(TransportError::ConnectionLost),
            None => Err(TransportError::WouldBlock),
        }
    }

    fn poll_create(&self) -> Result<PollId, TransportError> {
        let mut inner = self.inner.lock();
        let poll = inner.next_poll;
        inner.next_poll += 1;
        inner.polls.insert(poll, HashSet::new());
        Ok(poll)
    }

    fn poll_add(&self, poll: PollId, sock: SocketId) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.socket(sock)?;
        inner
            .polls
            .get_mut(&poll)
            .ok_or(TransportError::Other {
                code: 5013,
                message: "invalid poll id".to_string(),
            })?
            .insert(sock);
        Ok(())
    }

    fn poll_remove(&self, poll: PollId, sock: SocketId) {
        if let Some(watched) = self.inner.lock().polls.get_mut(&poll) {
            watched.remove(&sock);
        }
    }

    fn poll_wait(&self, poll: PollId, timeout: Duration) -> Result<usize, TransportError> {
        let invalid = || TransportError::Other {
            code: 5013,
            message: "invalid poll id".to_string(),
        };
        let ready = {
            let mut inner = self.inner.lock();
            inner.poll_waits += 1;
            inner.ready_count(poll)
        };
        match ready {
            None => return Err(invalid()),
            Some(0) => {}
            Some(ready) => return Ok(ready),
        }
        std::thread::sleep(timeout);
        self.inner.lock().ready_count(poll).ok_or_else(invalid)
    }

    fn poll_release(&self, poll: PollId) {
        self.inner.lock().polls.remove(&poll);
    }
}
