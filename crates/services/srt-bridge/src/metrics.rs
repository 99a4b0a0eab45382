//! Process-wide bridge counters
//!
//! Endpoint-level transport counters live on each endpoint; these track what
//! the sessions do with the media.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::gate::GateStats;

#[derive(Default)]
pub struct BridgeMetrics {
    sessions_started: AtomicU64,
    sessions_ended: AtomicU64,

    /// Chunks taken off the relay by ingest sessions
    chunks_relayed: AtomicU64,
    bytes_relayed: AtomicU64,

    /// Events dispatched onto the bus by ingest sessions
    frames_published: AtomicU64,

    frames_forwarded: AtomicU64,
    configs_synthesized: AtomicU64,
    frames_dropped: AtomicU64,

    /// Muxed writes the egress endpoint dropped while not connected
    writes_dropped: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            startup_time: AtomicU64::new(unix_now()),
            ..Default::default()
        }
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_relayed(&self, bytes: usize) {
        self.chunks_relayed.fetch_add(1, Ordering::Relaxed);
        self.bytes_relayed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frames_published(&self, frames: usize) {
        self.frames_published
            .fetch_add(frames as u64, Ordering::Relaxed);
    }

    /// Add the change between two gate counter readings
    pub fn gate_delta(&self, before: GateStats, after: GateStats) {
        self.frames_forwarded.fetch_add(
            after.forwarded.saturating_sub(before.forwarded),
            Ordering::Relaxed,
        );
        self.configs_synthesized.fetch_add(
            after.synthesized.saturating_sub(before.synthesized),
            Ordering::Relaxed,
        );
        self.frames_dropped.fetch_add(
            after.dropped.saturating_sub(before.dropped),
            Ordering::Relaxed,
        );
    }

    pub fn write_dropped(&self) {
        self.writes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeMetricsSnapshot {
        let started = self.sessions_started.load(Ordering::Relaxed);
        let ended = self.sessions_ended.load(Ordering::Relaxed);
        BridgeMetricsSnapshot {
            sessions_started: started,
            sessions_ended: ended,
            active_sessions: started.saturating_sub(ended),
            chunks_relayed: self.chunks_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            configs_synthesized: self.configs_synthesized.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            writes_dropped: self.writes_dropped.load(Ordering::Relaxed),
            uptime_secs: unix_now().saturating_sub(self.startup_time.load(Ordering::Relaxed)),
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct BridgeMetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub active_sessions: u64,
    pub chunks_relayed: u64,
    pub bytes_relayed: u64,
    pub frames_published: u64,
    pub frames_forwarded: u64,
    pub configs_synthesized: u64,
    pub frames_dropped: u64,
    pub writes_dropped: u64,
    pub uptime_secs: u64,
}

impl BridgeMetricsSnapshot {
    pub fn bytes_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.bytes_relayed as f64 / self.uptime_secs as f64
        }
    }
}

static GLOBAL_METRICS: std::sync::OnceLock<Arc<BridgeMetrics>> = std::sync::OnceLock::new();

pub fn global_metrics() -> Arc<BridgeMetrics> {
    GLOBAL_METRICS
        .get_or_init(|| Arc::new(BridgeMetrics::new()))
        .clone()
}
