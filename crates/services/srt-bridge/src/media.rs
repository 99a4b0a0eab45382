//! Media model shared by the bus, the codec gate and the TS codec
//!
//! Timestamps are milliseconds on a wrapping 32-bit clock.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

/// Audio encodings the bridge distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    Aac,
    Mp3,
    Opus,
    Other(u8),
}

/// Metadata of one audio frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTag {
    pub codec: AudioCodec,

    pub time_ms: u32,

    /// Payload carries codec setup (AAC AudioSpecificConfig) rather than samples
    pub is_config: bool,

    /// Sample rate in Hz, `0` when unknown
    pub rate: u32,

    /// Channel count, `0` when unknown
    pub channels: u8,
}

impl AudioTag {
    pub fn new(codec: AudioCodec, time_ms: u32) -> Self {
        Self {
            codec,
            time_ms,
            is_config: false,
            rate: 0,
            channels: 0,
        }
    }

    pub fn config(codec: AudioCodec, time_ms: u32) -> Self {
        Self {
            is_config: true,
            ..Self::new(codec, time_ms)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    Hevc,
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Decodable without reference to earlier frames
    Key,
    Inter,
    /// Codec setup (AVCDecoderConfigurationRecord for H.264)
    Config,
    Other,
}

/// Metadata of one video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoTag {
    pub codec: VideoCodec,

    pub frame: FrameType,

    /// Decode timestamp
    pub time_ms: u32,

    /// Presentation minus decode time
    pub composition_offset: i32,
}

impl VideoTag {
    pub fn new(codec: VideoCodec, frame: FrameType, time_ms: u32) -> Self {
        Self {
            codec,
            frame,
            time_ms,
            composition_offset: 0,
        }
    }
}

/// One event of a published stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Audio {
        track: u8,
        tag: AudioTag,
        payload: Bytes,
    },
    Video {
        track: u8,
        tag: VideoTag,
        payload: Bytes,
    },
    /// The stream ended; downstream state must be reset
    End,
}

impl fmt::Display for MediaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaEvent::Audio { tag, payload, .. } => write!(
                f,
                "audio {:?}{} t={} ({} bytes)",
                tag.codec,
                if tag.is_config { " config" } else { "" },
                tag.time_ms,
                payload.len()
            ),
            MediaEvent::Video { tag, payload, .. } => write!(
                f,
                "video {:?} {:?} t={} ({} bytes)",
                tag.codec,
                tag.frame,
                tag.time_ms,
                payload.len()
            ),
            MediaEvent::End => f.write_str("end"),
        }
    }
}

/// Hooks a subscriber implements; every hook defaults to a no-op
///
/// Called only from the media context.
pub trait MediaHandler {
    fn on_audio(&mut self, _track: u8, _tag: &AudioTag, _payload: &Bytes) {}

    fn on_video(&mut self, _track: u8, _tag: &VideoTag, _payload: &Bytes) {}

    fn on_end(&mut self) {}

    fn on_publish(&mut self, _stream: &str) {}

    fn on_unpublish(&mut self, _stream: &str) {}

    fn on_subscribe(&mut self, _stream: &str) {}

    fn on_unsubscribe(&mut self, _stream: &str) {}

    /// The publisher's source moved to another peer address
    fn on_address_changed(&mut self, _old: SocketAddr, _new: SocketAddr) {}

    /// Fatal condition that needs the subscriber to be restarted
    fn failure(&self) -> Option<String> {
        None
    }

    /// Route one event to the matching hook
    fn on_event(&mut self, event: &MediaEvent) {
        match event {
            MediaEvent::Audio {
                track,
                tag,
                payload,
            } => self.on_audio(*track, tag, payload),
            MediaEvent::Video {
                track,
                tag,
                payload,
            } => self.on_video(*track, tag, payload),
            MediaEvent::End => self.on_end(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        audio: usize,
        video: usize,
        end: usize,
    }

    impl MediaHandler for Counter {
        fn on_audio(&mut self, _track: u8, _tag: &AudioTag, _payload: &Bytes) {
            self.audio += 1;
        }

        fn on_video(&mut self, _track: u8, _tag: &VideoTag, _payload: &Bytes) {
            self.video += 1;
        }

        fn on_end(&mut self) {
            self.end += 1;
        }
    }

    #[test]
    fn test_on_event_routes_to_hooks() {
        let mut counter = Counter::default();
        counter.on_event(&MediaEvent::Audio {
            track: 0,
            tag: AudioTag::config(AudioCodec::Aac, 0),
            payload: Bytes::from_static(&[0x12, 0x10]),
        });
        counter.on_event(&MediaEvent::Video {
            track: 0,
            tag: VideoTag::new(VideoCodec::H264, FrameType::Key, 0),
            payload: Bytes::new(),
        });
        counter.on_event(&MediaEvent::End);
        counter.on_publish("ignored");

        assert_eq!((counter.audio, counter.video, counter.end), (1, 1, 1));
    }

    #[test]
    fn test_display() {
        let event = MediaEvent::Video {
            track: 0,
            tag: VideoTag::new(VideoCodec::H264, FrameType::Key, 40),
            payload: Bytes::from_static(b"abcd"),
        };
        assert_eq!(event.to_string(), "video H264 Key t=40 (4 bytes)");
        assert_eq!(MediaEvent::End.to_string(), "end");
    }
}
