//! Cross-thread relay
//!
//! Moves chunks and reset signals from a listener's monitor thread into the
//! single-threaded media context. Unbounded and strictly ordered: the I/O
//! thread never waits on the consumer.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::endpoint::ChunkSink;

/// One received chunk and its position in the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChunk {
    seq: u64,
    data: Bytes,
}

impl PendingChunk {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

/// Message carried by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A new caller was accepted
    Caller(SocketAddrV4),

    Chunk(PendingChunk),

    /// The caller went away; flush partially decoded state
    Reset,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay consumer is gone")]
    Closed,
}

/// Create a connected sender/receiver pair
pub fn relay() -> (RelaySender, RelayReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RelaySender {
            tx,
            next_seq: AtomicU64::new(0),
        },
        RelayReceiver { rx },
    )
}

/// Producer half, owned by the I/O side
#[derive(Debug)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<RelayEvent>,
    next_seq: AtomicU64,
}

impl RelaySender {
    pub fn push_chunk(&self, data: Bytes) -> Result<u64, RelayError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(RelayEvent::Chunk(PendingChunk { seq, data }))
            .map_err(|_| RelayError::Closed)?;
        Ok(seq)
    }

    pub fn push_caller(&self, peer: SocketAddrV4) -> Result<(), RelayError> {
        self.tx
            .send(RelayEvent::Caller(peer))
            .map_err(|_| RelayError::Closed)
    }

    pub fn push_reset(&self) -> Result<(), RelayError> {
        self.tx
            .send(RelayEvent::Reset)
            .map_err(|_| RelayError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ChunkSink for RelaySender {
    fn caller(&self, peer: SocketAddrV4) {
        if self.push_caller(peer).is_err() {
            tracing::debug!(peer = %peer, "relay closed, dropping caller notice");
        }
    }

    fn chunk(&self, data: Bytes) {
        if self.push_chunk(data).is_err() {
            tracing::debug!("relay closed, dropping received chunk");
        }
    }

    fn reset(&self) {
        if self.push_reset().is_err() {
            tracing::debug!("relay closed, dropping reset");
        }
    }
}

/// Consumer half, owned by the media context
#[derive(Debug)]
pub struct RelayReceiver {
    rx: mpsc::UnboundedReceiver<RelayEvent>,
}

impl RelayReceiver {
    /// Next event; `None` once every sender is gone and the queue is empty
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        self.rx.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}
