//! Per-endpoint counters
//!
//! Updated by the media context (writes) and the monitor thread
//! (reconnects, inbound chunks) without taking the endpoint lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Endpoint counters
#[derive(Debug, Default)]
pub struct EndpointStats {
    /// Bytes handed to the transport successfully
    bytes_sent: AtomicU64,

    /// Chunks handed to the transport successfully
    chunks_sent: AtomicU64,

    /// Chunks whose send call failed
    chunk_errors: AtomicU64,

    /// Writes dropped because no connected handle existed
    writes_dropped: AtomicU64,

    /// Bytes dropped along with those writes
    bytes_dropped: AtomicU64,

    /// Sender reconnect attempts made by the monitor
    reconnects: AtomicU64,

    /// Inbound connections accepted by a listener
    connections_accepted: AtomicU64,

    /// Inbound chunks forwarded by a listener
    chunks_received: AtomicU64,

    /// Inbound bytes forwarded by a listener
    bytes_received: AtomicU64,
}

impl EndpointStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn chunk_sent(&self, bytes: usize) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn chunk_failed(&self) {
        self.chunk_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn write_dropped(&self, bytes: usize) {
        self.writes_dropped.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_attempted(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn chunk_received(&self, bytes: usize) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EndpointStatsSnapshot {
        EndpointStatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunk_errors: self.chunk_errors.load(Ordering::Relaxed),
            writes_dropped: self.writes_dropped.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EndpointStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct EndpointStatsSnapshot {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub chunk_errors: u64,
    pub writes_dropped: u64,
    pub bytes_dropped: u64,
    pub reconnects: u64,
    pub connections_accepted: u64,
    pub chunks_received: u64,
    pub bytes_received: u64,
}

impl EndpointStatsSnapshot {
    /// Share of attempted chunks that reached the transport
    pub fn send_success_rate(&self) -> f64 {
        let attempted = self.chunks_sent + self.chunk_errors;
        if attempted == 0 {
            1.0
        } else {
            self.chunks_sent as f64 / attempted as f64
        }
    }
}
