//! Endpoint monitor thread
//!
//! Sender role: watch the socket every poll interval, discard inbound bytes
//! and replace the socket when the link breaks.
//!
//! Listener role: accept one caller at a time and stream its chunks into the
//! endpoint's [`ChunkSink`], resetting the sink when the caller goes away.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use crate::api::{ConnectionState, PollId, SocketId, TransportError};
use crate::endpoint::{ChunkSink, Mode, MonitorStatus, Shared, SrtError, TS_CHUNK_SIZE};

/// Pause after a zero-length read
const EMPTY_READ_BACKOFF: Duration = Duration::from_millis(10);

pub(crate) fn run(shared: Arc<Shared>) {
    shared.set_status(MonitorStatus::Running);
    tracing::debug!(role = %shared.role(), "SRT monitor started");

    let result = match &shared.mode {
        Mode::Sender => supervise_sender(&shared),
        Mode::Listener(sink) => serve_listener(&shared, sink.as_ref()),
    };

    match result {
        Ok(()) => {
            shared.set_status(MonitorStatus::Stopped);
            tracing::debug!(role = %shared.role(), "SRT monitor stopped");
        }
        Err(e) => {
            tracing::error!(role = %shared.role(), error = %e, "SRT monitor failed");
            shared.set_status(MonitorStatus::Failed(e.to_string()));
        }
    }
}

/// Wait for events on `poll`, never longer than one interval
///
/// Returns the ready count, `0` on timeout or on a poll error.
fn wait(shared: &Shared, poll: PollId) -> usize {
    let interval = shared.options.poll_interval;
    match shared.library.api().poll_wait(poll, interval) {
        Ok(ready) => ready,
        Err(e) if e.is_transient() => 0,
        Err(e) => {
            // The set may have been released by a concurrent disconnect
            tracing::debug!(role = %shared.role(), error = %e, "SRT poll wait failed");
            thread::sleep(interval);
            0
        }
    }
}

fn supervise_sender(shared: &Shared) -> Result<(), SrtError> {
    let api = shared.library.api();
    let mut scratch = vec![0u8; TS_CHUNK_SIZE];

    while !shared.stopped() {
        let Some(poll) = shared.current_poll() else {
            thread::sleep(shared.options.poll_interval);
            continue;
        };

        let ready = wait(shared, poll);
        if shared.stopped() {
            break;
        }

        let mut inner = shared.inner.lock();
        let link = match inner.link {
            // Replaced or parked while we were waiting
            Some(link) if link.poll == poll => link,
            _ => continue,
        };

        let state = api.state(link.socket);
        if state.is_lost() {
            tracing::warn!(
                addr = ?inner.addr,
                socket = link.socket,
                state = %state,
                "SRT link lost, reconnecting"
            );
            shared.disconnect_locked(&mut inner);
            shared.stats.reconnect_attempted();
            shared.connect_locked(&mut inner)?;
        } else if state == ConnectionState::Connected {
            if ready > 0 {
                drain(shared, link.socket, &mut scratch);
            }
        } else if ready > 0 {
            // Error event on a socket that is still closing: libsrt keeps
            // reporting it until the state settles
            drop(inner);
            tracing::trace!(socket = link.socket, state = %state, "SRT socket settling");
            thread::sleep(shared.options.poll_interval);
        }
    }

    Ok(())
}

/// Read and discard whatever the peer sent
fn drain(shared: &Shared, socket: SocketId, scratch: &mut [u8]) {
    let api = shared.library.api();
    let mut discarded = 0usize;
    loop {
        match api.recv(socket, scratch) {
            Ok(0) => break,
            Ok(n) => discarded += n,
            Err(TransportError::WouldBlock) | Err(TransportError::TimedOut) => break,
            Err(e) => {
                tracing::debug!(socket, error = %e, "SRT drain stopped");
                break;
            }
        }
    }
    if discarded > 0 {
        tracing::trace!(socket, bytes = discarded, "discarded inbound bytes on sender");
    }
}

fn serve_listener(shared: &Shared, sink: &dyn ChunkSink) -> Result<(), SrtError> {
    let api = shared.library.api();

    while !shared.stopped() {
        let Some(poll) = shared.current_poll() else {
            thread::sleep(shared.options.poll_interval);
            continue;
        };

        if wait(shared, poll) == 0 || shared.stopped() {
            continue;
        }

        let accepted = {
            let inner = shared.inner.lock();
            match inner.link {
                Some(link) if link.poll == poll => api.accept(link.socket),
                _ => continue,
            }
        };

        let (client, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) if e.is_transient() => continue,
            Err(source) => {
                return Err(SrtError::Transport {
                    op: "accept",
                    source,
                })
            }
        };

        shared.stats.connection_accepted();
        tracing::info!(peer = %peer, socket = client, "SRT caller connected");
        sink.caller(peer);

        stream_client(shared, sink, client);

        sink.reset();
        api.close(client);
        tracing::info!(peer = %peer, socket = client, "SRT caller disconnected");
    }

    Ok(())
}

/// Forward one caller's chunks until it goes away or a stop is requested
fn stream_client(shared: &Shared, sink: &dyn ChunkSink, client: SocketId) {
    let api = shared.library.api();
    let interval = shared.options.poll_interval;

    let setup = api
        .set_recv_blocking(client, true)
        .and_then(|_| api.set_recv_timeout(client, interval))
        .and_then(|_| api.poll_create());
    let poll = match setup {
        Ok(poll) => poll,
        Err(e) => {
            tracing::warn!(socket = client, error = %e, "failed to prepare SRT caller socket");
            return;
        }
    };
    if let Err(e) = api.poll_add(poll, client) {
        tracing::warn!(socket = client, error = %e, "failed to watch SRT caller socket");
        api.poll_release(poll);
        return;
    }

    let mut buf = vec![0u8; TS_CHUNK_SIZE];
    while !shared.stopped() {
        match api.recv(client, &mut buf) {
            Ok(0) => thread::sleep(EMPTY_READ_BACKOFF),
            Ok(n) => {
                shared.stats.chunk_received(n);
                sink.chunk(Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) if e.is_transient() => {
                wait(shared, poll);
            }
            Err(TransportError::ConnectionLost) => break,
            Err(e) => {
                tracing::warn!(socket = client, error = %e, "SRT receive failed");
                break;
            }
        }
    }

    api.poll_remove(poll, client);
    api.poll_release(poll);
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddrV4;
    use std::time::Instant;

    use parking_lot::Mutex;

    use crate::endpoint::{EndpointOptions, SrtEndpoint, WriteOutcome};
    use crate::library::SrtLibrary;
    use crate::mock::{MockInbound, MockSrt};

    use super::*;

    fn fast() -> EndpointOptions {
        EndpointOptions {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Caller(SocketAddrV4),
        Chunk(Bytes),
        Reset,
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<Seen>>,
    }

    impl RecordingSink {
        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().clone()
        }
    }

    impl ChunkSink for RecordingSink {
        fn caller(&self, peer: SocketAddrV4) {
            self.seen.lock().push(Seen::Caller(peer));
        }

        fn chunk(&self, data: Bytes) {
            self.seen.lock().push(Seen::Chunk(data));
        }

        fn reset(&self) {
            self.seen.lock().push(Seen::Reset);
        }
    }

    fn peer() -> SocketAddrV4 {
        "10.0.0.7:40000".parse().unwrap()
    }

    #[test]
    fn test_sender_reconnects_after_link_loss() {
        let mock = MockSrt::new();
        let endpoint = SrtEndpoint::sender(SrtLibrary::new(mock.clone()), fast());
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();
        let first = mock.last_socket().unwrap();

        mock.break_connected();
        assert!(wait_until(|| mock.created_sockets().len() == 2));
        assert!(wait_until(|| endpoint.is_connected()));

        assert_eq!(mock.socket_state(first), ConnectionState::Closed);
        assert_eq!(endpoint.stats().reconnects, 1);
        assert_eq!(endpoint.monitor_status(), MonitorStatus::Running);
        assert!(!endpoint.write(&[0u8; 188]).is_dropped());
    }

    #[test]
    fn test_writes_during_gap_are_dropped() {
        let mock = MockSrt::new();
        let endpoint = SrtEndpoint::sender(SrtLibrary::new(mock.clone()), fast());
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();

        // The replacement socket stays in the handshake
        mock.set_connect_state(ConnectionState::Connecting);
        mock.break_connected();
        assert!(wait_until(|| mock.created_sockets().len() == 2));

        assert_eq!(
            endpoint.write(&[0u8; 2000]),
            WriteOutcome::Dropped { bytes: 2000 }
        );
        assert_eq!(mock.sent().len(), 0);

        let replacement = mock.last_socket().unwrap();
        mock.set_state(replacement, ConnectionState::Connected);
        assert!(matches!(
            endpoint.write(&[0u8; 2000]),
            WriteOutcome::Sent { chunks: 2, .. }
        ));
    }

    #[test]
    fn test_failed_reconnect_is_fatal() {
        let mock = MockSrt::new();
        let endpoint = SrtEndpoint::sender(SrtLibrary::new(mock.clone()), fast());
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();

        mock.fail_create(true);
        mock.break_connected();

        assert!(wait_until(|| matches!(
            endpoint.monitor_status(),
            MonitorStatus::Failed(_)
        )));
        assert_eq!(endpoint.state(), ConnectionState::NonExistent);
        assert!(endpoint.write(&[0u8; 10]).is_dropped());
    }

    #[test]
    fn test_closing_socket_does_not_spin() {
        let mock = MockSrt::new();
        let endpoint = SrtEndpoint::sender(SrtLibrary::new(mock.clone()), fast());
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();
        let socket = mock.last_socket().unwrap();

        mock.set_state(socket, ConnectionState::Closing);
        let before = mock.poll_waits();
        thread::sleep(Duration::from_millis(100));
        let waits = mock.poll_waits() - before;

        // One wait per 10 ms interval, not a busy loop
        assert!(waits <= 25, "monitor spun {waits} times");
        assert_eq!(mock.created_sockets().len(), 1);

        mock.set_state(socket, ConnectionState::Closed);
        assert!(wait_until(|| mock.created_sockets().len() == 2));
        assert!(wait_until(|| endpoint.is_connected()));
    }

    #[test]
    fn test_explicit_disconnect_parks_link() {
        let mock = MockSrt::new();
        let endpoint = SrtEndpoint::sender(SrtLibrary::new(mock.clone()), fast());
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();

        endpoint.disconnect();
        thread::sleep(Duration::from_millis(100));

        assert_eq!(mock.created_sockets().len(), 1);
        assert_eq!(endpoint.state(), ConnectionState::NonExistent);
        assert_eq!(endpoint.stats().reconnects, 0);

        endpoint.connect().unwrap();
        assert!(endpoint.is_connected());
    }

    #[test]
    fn test_sender_discards_inbound_bytes() {
        let mock = MockSrt::new();
        let endpoint = SrtEndpoint::sender(SrtLibrary::new(mock.clone()), fast());
        endpoint.open("127.0.0.1:9000").unwrap();
        endpoint.connect().unwrap();
        let socket = mock.last_socket().unwrap();

        mock.push_inbound(socket, MockInbound::Data(Bytes::from_static(b"ack")));
        mock.push_inbound(socket, MockInbound::Data(Bytes::from_static(b"ack")));

        assert!(wait_until(|| mock.pending_inbound(socket) == 0));
        assert!(endpoint.is_connected());
        assert_eq!(endpoint.stats().chunks_received, 0);
    }

    #[test]
    fn test_close_stops_monitor() {
        let mock = MockSrt::new();
        let endpoint = SrtEndpoint::sender(SrtLibrary::new(mock.clone()), fast());
        endpoint.open("127.0.0.1:9000").unwrap();
        assert!(wait_until(|| endpoint.monitor_status() == MonitorStatus::Running));

        endpoint.close();
        assert_eq!(endpoint.monitor_status(), MonitorStatus::Stopped);
    }

    #[test]
    fn test_listener_forwards_chunks_then_resets() {
        let mock = MockSrt::new();
        let sink = Arc::new(RecordingSink::default());
        let endpoint = SrtEndpoint::listener(SrtLibrary::new(mock.clone()), fast(), sink.clone());
        endpoint.open("0.0.0.0:1234").unwrap();
        endpoint.connect().unwrap();

        mock.queue_client(
            peer(),
            vec![
                MockInbound::Data(Bytes::from_static(&[0x47u8; 1316])),
                MockInbound::Error(TransportError::WouldBlock),
                MockInbound::Data(Bytes::from_static(&[0x47u8; 188])),
            ],
        );

        assert!(wait_until(|| sink.seen().len() == 4));
        assert_eq!(
            sink.seen(),
            vec![
                Seen::Caller(peer()),
                Seen::Chunk(Bytes::from_static(&[0x47u8; 1316])),
                Seen::Chunk(Bytes::from_static(&[0x47u8; 188])),
                Seen::Reset,
            ]
        );

        let stats = endpoint.stats();
        assert_eq!(stats.connections_accepted, 1);
        assert_eq!(stats.chunks_received, 2);
        assert_eq!(stats.bytes_received, 1504);
        assert_eq!(endpoint.state(), ConnectionState::Listening);
    }

    #[test]
    fn test_listener_accepts_next_caller() {
        let mock = MockSrt::new();
        let sink = Arc::new(RecordingSink::default());
        let endpoint = SrtEndpoint::listener(SrtLibrary::new(mock.clone()), fast(), sink.clone());
        endpoint.open("0.0.0.0:1234").unwrap();
        endpoint.connect().unwrap();

        mock.queue_client(
            peer(),
            vec![
                MockInbound::Data(Bytes::from_static(b"first")),
                MockInbound::Error(TransportError::Other {
                    code: 4000,
                    message: "peer error".to_string(),
                }),
                MockInbound::Data(Bytes::from_static(b"never read")),
            ],
        );
        let next: SocketAddrV4 = "10.0.0.8:40001".parse().unwrap();
        mock.queue_client(next, vec![MockInbound::Data(Bytes::from_static(b"second"))]);

        assert!(wait_until(|| sink.seen().len() == 6));
        assert_eq!(
            sink.seen(),
            vec![
                Seen::Caller(peer()),
                Seen::Chunk(Bytes::from_static(b"first")),
                Seen::Reset,
                Seen::Caller(next),
                Seen::Chunk(Bytes::from_static(b"second")),
                Seen::Reset,
            ]
        );
        assert_eq!(endpoint.stats().connections_accepted, 2);

        for socket in mock.created_sockets().into_iter().skip(1) {
            assert_eq!(mock.socket_state(socket), ConnectionState::Closed);
        }
    }

    #[test]
    fn test_listener_switches_caller_to_blocking_receive() {
        let mock = MockSrt::new();
        let sink = Arc::new(RecordingSink::default());
        let endpoint = SrtEndpoint::listener(SrtLibrary::new(mock.clone()), fast(), sink.clone());
        endpoint.open("0.0.0.0:1234").unwrap();
        endpoint.connect().unwrap();
        let listen_socket = mock.last_socket().unwrap();

        mock.queue_client(peer(), vec![MockInbound::Data(Bytes::from_static(b"x"))]);
        assert!(wait_until(|| sink.seen().len() == 3));

        let client = mock.last_socket().unwrap();
        assert_ne!(client, listen_socket);
        assert!(mock.is_recv_blocking(client));
        assert!(!mock.is_recv_blocking(listen_socket));
    }
}
