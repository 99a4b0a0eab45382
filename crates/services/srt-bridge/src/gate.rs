//! Codec gate
//!
//! Decides, per elementary stream, whether a frame may reach the muxer and
//! whether a configuration frame has to be synthesized ahead of it. A
//! receiver that tunes in at any key frame must find the codec setup right
//! before it, so:
//!
//! * audio is held back until an `is_config` frame has been seen;
//! * video is held back until a configuration is known and a key frame
//!   arrives, and every later key frame is preceded by a fresh copy of the
//!   configuration.
//!
//! The gate only returns decisions; it never touches the muxer or the network.

use bytes::Bytes;

use crate::avc;
use crate::media::{AudioTag, FrameType, VideoCodec, VideoTag};

/// A frame the gate lets through, in muxer order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Forward {
    Audio {
        tag: AudioTag,
        payload: Bytes,
        /// Configuration replayed from the cache rather than received now
        synthetic: bool,
    },
    Video {
        tag: VideoTag,
        payload: Bytes,
        synthetic: bool,
    },
}

impl Forward {
    pub fn is_synthetic(&self) -> bool {
        match self {
            Forward::Audio { synthetic, .. } | Forward::Video { synthetic, .. } => *synthetic,
        }
    }

    pub fn time_ms(&self) -> u32 {
        match self {
            Forward::Audio { tag, .. } => tag.time_ms,
            Forward::Video { tag, .. } => tag.time_ms,
        }
    }
}

/// Last configuration seen on one stream
#[derive(Debug, Clone)]
pub struct CodecCache<T> {
    config: Option<(T, Bytes)>,
    sent: bool,
}

impl<T> Default for CodecCache<T> {
    fn default() -> Self {
        Self {
            config: None,
            sent: false,
        }
    }
}

impl<T> CodecCache<T> {
    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    /// Configuration has been forwarded at least once
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    fn store(&mut self, tag: T, payload: Bytes) {
        self.config = Some((tag, payload));
    }

    fn clear(&mut self) -> bool {
        let had_state = self.config.is_some() || self.sent;
        self.config = None;
        self.sent = false;
        had_state
    }
}

/// Gate decision counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GateStats {
    pub forwarded: u64,
    pub synthesized: u64,
    pub dropped: u64,
}

/// Audio and video gating state of one egress session
#[derive(Debug, Default)]
pub struct CodecGate {
    audio: CodecCache<AudioTag>,
    video: CodecCache<VideoTag>,
    stats: GateStats,
}

impl CodecGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audio(&self) -> &CodecCache<AudioTag> {
        &self.audio
    }

    pub fn video(&self) -> &CodecCache<VideoTag> {
        &self.video
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }

    /// Neither stream holds configuration state
    pub fn is_clean(&self) -> bool {
        !self.audio.is_configured()
            && !self.audio.is_sent()
            && !self.video.is_configured()
            && !self.video.is_sent()
    }

    pub fn on_audio(&mut self, tag: &AudioTag, payload: &Bytes) -> Vec<Forward> {
        if tag.is_config {
            self.audio.store(tag.clone(), payload.clone());
        }

        let mut out = Vec::with_capacity(2);
        if !self.audio.sent {
            let Some((config_tag, config)) = &self.audio.config else {
                self.stats.dropped += 1;
                tracing::trace!(time_ms = tag.time_ms, "audio frame dropped, no codec config yet");
                return out;
            };

            self.audio.sent = true;
            tracing::info!(codec = ?config_tag.codec, "audio codec config sent");
            if !tag.is_config {
                out.push(Forward::Audio {
                    tag: AudioTag {
                        time_ms: tag.time_ms,
                        ..config_tag.clone()
                    },
                    payload: config.clone(),
                    synthetic: true,
                });
            }
        }

        out.push(Forward::Audio {
            tag: tag.clone(),
            payload: payload.clone(),
            synthetic: false,
        });
        self.count(&out);
        out
    }

    pub fn on_video(&mut self, tag: &VideoTag, payload: &Bytes) -> Vec<Forward> {
        if tag.frame == FrameType::Config {
            return self.on_video_config(tag, payload);
        }

        let mut explicit = false;
        if tag.codec == VideoCodec::H264 && tag.frame == FrameType::Key {
            if let Some((sps, pps)) = avc::extract_parameter_sets(payload) {
                explicit = !self.video.is_configured() && !self.video.sent;
                self.video.store(
                    VideoTag::new(tag.codec, FrameType::Config, tag.time_ms),
                    avc::build_decoder_config(&sps, &pps),
                );
            }
        }

        let mut out = Vec::with_capacity(2);
        if !self.video.sent {
            if !self.video.is_configured() {
                self.stats.dropped += 1;
                tracing::trace!(time_ms = tag.time_ms, "video frame dropped, no codec config yet");
                return out;
            }
            if tag.frame != FrameType::Key {
                self.stats.dropped += 1;
                tracing::debug!(time_ms = tag.time_ms, "video frame dropped to wait for the first key frame");
                return out;
            }

            self.video.sent = true;
            tracing::info!(codec = ?tag.codec, time_ms = tag.time_ms, "video codec config sent");
            if !explicit {
                out.extend(self.synthesize_video_config(tag.time_ms));
            }
        } else if tag.frame == FrameType::Key {
            out.extend(self.synthesize_video_config(tag.time_ms));
        }

        out.push(Forward::Video {
            tag: tag.clone(),
            payload: payload.clone(),
            synthetic: false,
        });
        self.count(&out);
        out
    }

    fn on_video_config(&mut self, tag: &VideoTag, payload: &Bytes) -> Vec<Forward> {
        if tag.codec == VideoCodec::H264 {
            if let Err(e) = avc::parse_decoder_config(payload) {
                self.stats.dropped += 1;
                tracing::warn!(time_ms = tag.time_ms, error = %e, "malformed H.264 config dropped");
                return Vec::new();
            }
        }
        self.video.store(tag.clone(), payload.clone());
        tracing::debug!(codec = ?tag.codec, time_ms = tag.time_ms, "video codec config saved");

        if !self.video.sent {
            // Sent ahead of the first key frame
            return Vec::new();
        }

        let out = vec![Forward::Video {
            tag: tag.clone(),
            payload: payload.clone(),
            synthetic: false,
        }];
        self.count(&out);
        out
    }

    fn synthesize_video_config(&self, time_ms: u32) -> Option<Forward> {
        let (config_tag, config) = self.video.config.as_ref()?;
        Some(Forward::Video {
            tag: VideoTag {
                time_ms,
                composition_offset: 0,
                ..config_tag.clone()
            },
            payload: config.clone(),
            synthetic: true,
        })
    }

    fn count(&mut self, out: &[Forward]) {
        for forward in out {
            if forward.is_synthetic() {
                self.stats.synthesized += 1;
            } else {
                self.stats.forwarded += 1;
            }
        }
    }

    /// Forget both configurations so the next stream starts from scratch
    ///
    /// Returns whether there was anything to forget; calling it again is a
    /// no-op.
    pub fn reset(&mut self) -> bool {
        let audio = self.audio.clear();
        let video = self.video.clear();
        if audio || video {
            tracing::debug!("codec gate reset");
        }
        audio || video
    }
}
