//! SRT transport for tsbridge
//!
//! Socket lifecycle and supervision for both directions of the bridge.
//!
//! # Architecture
//!
//! ```text
//!   media context (tokio, single thread)          monitor thread (std)
//!  ┌───────────────────────────────────┐        ┌──────────────────────────┐
//!  │ EgressSession ── write() ─────────┼──lock──┼─▶ SrtEndpoint (sender)   │
//!  │                                   │        │   poll 250 ms, reconnect │
//!  │ IngestSession ◀── RelayReceiver ◀─┼─relay──┼── SrtEndpoint (listener) │
//!  │                                   │        │   accept, recv 1316 B    │
//!  └───────────────────────────────────┘        └──────────────────────────┘
//! ```
//!
//! All socket calls go through [`SrtApi`]. Enable the `libsrt` feature for
//! the native binding; the `mock` feature exposes a scripted transport.

pub mod api;
pub mod endpoint;
#[cfg(feature = "libsrt")]
pub mod ffi;
pub mod library;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod monitor;
pub mod relay;
pub mod stats;

pub use api::{ConnectionState, PollId, SocketId, SrtApi, TransportError};
pub use endpoint::{
    ChunkSink, EndpointOptions, MonitorStatus, Role, SrtEndpoint, SrtError, WriteOutcome,
    DEFAULT_POLL_INTERVAL, TS_CHUNK_SIZE,
};
#[cfg(feature = "libsrt")]
pub use ffi::LibSrt;
pub use library::SrtLibrary;
pub use relay::{relay, PendingChunk, RelayError, RelayEvent, RelayReceiver, RelaySender};
pub use stats::EndpointStatsSnapshot;
