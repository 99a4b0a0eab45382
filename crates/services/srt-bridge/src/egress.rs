//! Egress: bus subscriber that muxes gated frames into TS and pushes them
//! to an SRT target

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tsbridge_srt::{
    EndpointOptions, EndpointStatsSnapshot, MonitorStatus, SrtEndpoint, SrtLibrary, WriteOutcome,
};

use crate::error::SessionError;
use crate::gate::{CodecGate, Forward, GateStats};
use crate::media::{AudioTag, MediaHandler, VideoTag};
use crate::metrics::{global_metrics, BridgeMetrics};
use crate::ts::{TsMuxer, TsWriter};

/// Where muxed TS bytes go
///
/// Writes must never block the media context.
pub trait TsSink {
    fn write_ts(&self, data: &[u8]) -> WriteOutcome;

    fn close(&self) {}

    fn stats(&self) -> EndpointStatsSnapshot {
        EndpointStatsSnapshot::default()
    }

    /// Health of whatever keeps the link up
    fn monitor_status(&self) -> MonitorStatus {
        MonitorStatus::Running
    }
}

impl TsSink for SrtEndpoint {
    fn write_ts(&self, data: &[u8]) -> WriteOutcome {
        self.write(data)
    }

    fn close(&self) {
        SrtEndpoint::close(self);
    }

    fn stats(&self) -> EndpointStatsSnapshot {
        SrtEndpoint::stats(self)
    }

    fn monitor_status(&self) -> MonitorStatus {
        SrtEndpoint::monitor_status(self)
    }
}

pub struct EgressSession {
    stream: String,
    gate: CodecGate,
    muxer: Box<dyn TsMuxer>,
    sink: Box<dyn TsSink>,
    metrics: Arc<BridgeMetrics>,
    /// `begin` has run for the current stream
    begun: bool,
    closed: bool,
}

impl EgressSession {
    /// Open a sender endpoint to `target` and connect it
    ///
    /// A target that cannot be resolved or connected is fatal for the
    /// session; once connected, link loss is repaired by the endpoint.
    pub fn start(
        stream: &str,
        target: &str,
        options: EndpointOptions,
        library: Arc<SrtLibrary>,
    ) -> Result<Self, SessionError> {
        let endpoint = SrtEndpoint::sender(library, options);
        endpoint.open(target)?;
        endpoint.connect()?;
        tracing::info!(stream = %stream, target = %target, "egress session started");
        Ok(Self::new(stream, Box::new(endpoint), Box::new(TsWriter::new())))
    }

    pub fn new(stream: &str, sink: Box<dyn TsSink>, muxer: Box<dyn TsMuxer>) -> Self {
        let metrics = global_metrics();
        metrics.session_started();
        Self {
            stream: stream.to_string(),
            gate: CodecGate::new(),
            muxer,
            sink,
            metrics,
            begun: false,
            closed: false,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn gate(&self) -> &CodecGate {
        &self.gate
    }

    pub fn sink_stats(&self) -> EndpointStatsSnapshot {
        self.sink.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn monitor_status(&self) -> MonitorStatus {
        self.sink.monitor_status()
    }

    /// The link can no longer recover on its own
    pub fn is_failed(&self) -> bool {
        matches!(self.monitor_status(), MonitorStatus::Failed(_))
    }

    fn emit(&mut self, track: u8, before: GateStats, forwards: Vec<Forward>) {
        self.metrics.gate_delta(before, self.gate.stats());
        if forwards.is_empty() {
            return;
        }

        let mut out = BytesMut::new();
        if !self.begun {
            self.muxer.begin(&mut out);
            self.begun = true;
        }
        for forward in &forwards {
            match forward {
                Forward::Audio { tag, payload, .. } => {
                    self.muxer.write_audio(track, tag, payload, &mut out)
                }
                Forward::Video { tag, payload, .. } => {
                    self.muxer.write_video(track, tag, payload, &mut out)
                }
            }
        }
        if out.is_empty() {
            return;
        }

        match self.sink.write_ts(&out) {
            WriteOutcome::Dropped { bytes } => {
                self.metrics.write_dropped();
                tracing::trace!(stream = %self.stream, bytes, "egress write dropped, link down");
            }
            WriteOutcome::Sent { failed_chunks, .. } if failed_chunks > 0 => {
                tracing::debug!(stream = %self.stream, failed_chunks, "egress write partially failed");
            }
            WriteOutcome::Sent { .. } => {}
        }
    }

    /// Return to "waiting for configuration"; the muxer trailer is discarded
    ///
    /// Returns whether there was any state to clear.
    pub fn reset(&mut self) -> bool {
        let cleared = self.gate.reset();
        let begun = std::mem::take(&mut self.begun);
        if begun {
            let mut discard = BytesMut::new();
            self.muxer.end(&mut discard);
        }
        if cleared || begun {
            tracing::debug!(stream = %self.stream, "egress session reset");
        }
        cleared || begun
    }

    /// Reset, then close the sink; idempotent
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.reset();
        self.sink.close();
        self.closed = true;
        self.metrics.session_ended();

        let gate = self.gate.stats();
        let link = self.sink.stats();
        tracing::info!(
            stream = %self.stream,
            forwarded = gate.forwarded,
            synthesized = gate.synthesized,
            dropped = gate.dropped,
            bytes_sent = link.bytes_sent,
            writes_dropped = link.writes_dropped,
            reconnects = link.reconnects,
            "egress session closed"
        );
    }
}

impl MediaHandler for EgressSession {
    fn on_audio(&mut self, track: u8, tag: &AudioTag, payload: &Bytes) {
        if self.closed {
            return;
        }
        let before = self.gate.stats();
        let forwards = self.gate.on_audio(tag, payload);
        self.emit(track, before, forwards);
    }

    fn on_video(&mut self, track: u8, tag: &VideoTag, payload: &Bytes) {
        if self.closed {
            return;
        }
        let before = self.gate.stats();
        let forwards = self.gate.on_video(tag, payload);
        self.emit(track, before, forwards);
    }

    fn on_end(&mut self) {
        self.reset();
    }

    fn on_publish(&mut self, stream: &str) {
        tracing::info!(stream = %stream, "egress source published");
    }

    fn on_unpublish(&mut self, stream: &str) {
        tracing::info!(stream = %stream, "egress source unpublished");
        self.reset();
    }

    fn on_unsubscribe(&mut self, _stream: &str) {
        self.reset();
    }

    fn on_address_changed(&mut self, old: SocketAddr, new: SocketAddr) {
        tracing::info!(stream = %self.stream, %old, %new, "source address changed");
    }

    fn failure(&self) -> Option<String> {
        match self.monitor_status() {
            MonitorStatus::Failed(reason) if !self.closed => Some(reason),
            _ => None,
        }
    }
}

impl Drop for EgressSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for EgressSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressSession")
            .field("stream", &self.stream)
            .field("gate", &self.gate)
            .field("begun", &self.begun)
            .field("closed", &self.closed)
            .finish()
    }
}
