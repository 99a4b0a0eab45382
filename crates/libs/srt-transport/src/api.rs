//! Transport seam over the SRT library
//!
//! Every socket operation the endpoint and its monitor perform goes through
//! [`SrtApi`]. The native binding lives in [`crate::ffi`] (feature `libsrt`);
//! tests drive the same lifecycle code through [`crate::mock::MockSrt`].

use std::fmt;
use std::net::SocketAddrV4;
use std::time::Duration;

use serde::Serialize;

/// SRT socket handle
pub type SocketId = i32;

/// SRT event-notification (epoll) set handle
pub type PollId = i32;

/// Socket state as reported by the transport
///
/// Application code never sets this; it is read back from the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Init,
    Opened,
    Listening,
    Connecting,
    Connected,
    Broken,
    Closing,
    Closed,
    NonExistent,
}

impl ConnectionState {
    /// The link is gone and the socket must be replaced
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            ConnectionState::Broken | ConnectionState::Closed | ConnectionState::NonExistent
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Init => "init",
            ConnectionState::Opened => "opened",
            ConnectionState::Listening => "listening",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Broken => "broken",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::NonExistent => "non-existent",
        };
        f.write_str(name)
    }
}

/// Errors reported by a single transport call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    TimedOut,

    #[error("connection lost")]
    ConnectionLost,

    #[error("SRT error {code}: {message}")]
    Other { code: i32, message: String },
}

impl TransportError {
    /// Retry later; never surfaced as a failure
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::WouldBlock | TransportError::TimedOut)
    }
}

/// Socket-level operations of an SRT implementation
///
/// Mirrors the subset of the libsrt C API the bridge needs. Implementations
/// must be callable from the monitor thread and the media context alike;
/// serialisation of calls on one socket is the endpoint's job.
pub trait SrtApi: Send + Sync {
    /// Start the process-wide library state
    fn startup(&self) -> Result<(), TransportError>;

    /// Tear down the process-wide library state
    fn cleanup(&self);

    fn create_socket(&self) -> Result<SocketId, TransportError>;

    fn close(&self, sock: SocketId);

    fn state(&self, sock: SocketId) -> ConnectionState;

    fn set_send_blocking(&self, sock: SocketId, blocking: bool) -> Result<(), TransportError>;

    fn set_recv_blocking(&self, sock: SocketId, blocking: bool) -> Result<(), TransportError>;

    /// Upper bound for a blocking receive before it reports `TimedOut`
    fn set_recv_timeout(&self, sock: SocketId, timeout: Duration) -> Result<(), TransportError>;

    fn set_latency(&self, sock: SocketId, latency_ms: u32) -> Result<(), TransportError>;

    fn connect(&self, sock: SocketId, addr: SocketAddrV4) -> Result<(), TransportError>;

    fn bind(&self, sock: SocketId, addr: SocketAddrV4) -> Result<(), TransportError>;

    fn listen(&self, sock: SocketId, backlog: i32) -> Result<(), TransportError>;

    fn accept(&self, sock: SocketId) -> Result<(SocketId, SocketAddrV4), TransportError>;

    fn send(&self, sock: SocketId, data: &[u8]) -> Result<usize, TransportError>;

    fn recv(&self, sock: SocketId, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn poll_create(&self) -> Result<PollId, TransportError>;

    /// Watch `sock` for readability and error events
    fn poll_add(&self, poll: PollId, sock: SocketId) -> Result<(), TransportError>;

    fn poll_remove(&self, poll: PollId, sock: SocketId);

    /// Wait up to `timeout` for events; returns the number of ready sockets,
    /// `0` when the wait timed out
    fn poll_wait(&self, poll: PollId, timeout: Duration) -> Result<usize, TransportError>;

    fn poll_release(&self, poll: PollId);
}
