//! MPEG-TS muxer and demuxer
//!
//! Sessions only see the [`TsMuxer`] and [`TsDemuxer`] traits. [`TsWriter`]
//! and [`TsReader`] are the default implementations: one program carrying
//! H.264 video and AAC (ADTS) or MP3 audio.

mod adts;
mod reader;
mod writer;

use bytes::BytesMut;

use crate::media::{AudioTag, MediaEvent, VideoTag};

pub use adts::{AacConfig, SAMPLE_RATES};
pub use reader::TsReader;
pub use writer::TsWriter;

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;

pub const STREAM_TYPE_MP3: u8 = 0x03;
pub const STREAM_TYPE_AAC: u8 = 0x0F;
pub const STREAM_TYPE_H264: u8 = 0x1B;

/// PTS/DTS ticks per millisecond
pub const TICKS_PER_MS: u64 = 90;

/// Turns gated media frames into TS bytes
pub trait TsMuxer {
    /// Stream prologue (PAT/PMT)
    fn begin(&mut self, out: &mut BytesMut);

    fn write_audio(&mut self, track: u8, tag: &AudioTag, payload: &[u8], out: &mut BytesMut);

    fn write_video(&mut self, track: u8, tag: &VideoTag, payload: &[u8], out: &mut BytesMut);

    /// Finish the stream and forget all codec state
    fn end(&mut self, out: &mut BytesMut);
}

/// Turns TS bytes back into media events
pub trait TsDemuxer {
    /// Feed bytes in arbitrary slices; returns the events completed so far
    fn read(&mut self, data: &[u8]) -> Vec<MediaEvent>;

    /// Emit whatever is pending followed by [`MediaEvent::End`] and reset
    fn flush(&mut self) -> Vec<MediaEvent>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TsError {
    #[error("PSI section truncated")]
    TruncatedSection,

    #[error("PSI section CRC mismatch")]
    BadCrc,

    #[error("missing PES start code")]
    NotPes,

    #[error("PES header truncated")]
    TruncatedPes,

    #[error("ADTS header invalid")]
    BadAdts,

    #[error("unsupported AAC configuration: {0}")]
    UnsupportedAac(String),
}

/// CRC-32/MPEG-2 as used by PSI sections
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}
