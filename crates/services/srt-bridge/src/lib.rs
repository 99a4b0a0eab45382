//! SRT <-> MPEG-TS bridge
//!
//! Two sessions share one in-process [`bus::MediaBus`]:
//!
//! ```text
//!  ingest:  caller --SRT--> listener endpoint --relay--> TsReader --> bus "srtIn"
//!  egress:  bus "srtIn" --> CodecGate --> TsWriter --> sender endpoint --SRT--> target
//! ```
//!
//! Transport lifecycle, reconnection and the I/O-thread relay live in
//! `tsbridge-srt`. This crate holds the media side: the codec gate that
//! keeps configuration frames ahead of the payload they describe, the TS
//! codec, and the session glue.

pub mod avc;
pub mod bus;
pub mod config;
pub mod egress;
pub mod error;
pub mod gate;
pub mod ingest;
pub mod media;
pub mod metrics;
pub mod ts;

pub use bus::{BusError, MediaBus, SubscriberId};
pub use config::{Config, ConfigError};
pub use egress::{EgressSession, TsSink};
pub use error::SessionError;
pub use gate::{CodecGate, Forward, GateStats};
pub use ingest::{check_subscribers, IngestSession};
pub use media::{
    AudioCodec, AudioTag, FrameType, MediaEvent, MediaHandler, VideoCodec, VideoTag,
};
pub use metrics::{global_metrics, BridgeMetrics, BridgeMetricsSnapshot};
