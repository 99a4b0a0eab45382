use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};

use super::adts::AacConfig;
use super::{
    crc32_mpeg2, TsDemuxer, TsError, PAT_PID, STREAM_TYPE_AAC, STREAM_TYPE_H264, STREAM_TYPE_MP3,
    TICKS_PER_MS, TS_PACKET_SIZE, TS_SYNC_BYTE,
};
use crate::avc::{self, NAL_AUD, NAL_IDR, NAL_PPS, NAL_SPS};
use crate::media::{AudioCodec, AudioTag, FrameType, MediaEvent, VideoCodec, VideoTag};

/// MPEG-1 layer 3 variant signalled by some muxers
const STREAM_TYPE_MP3_LSF: u8 = 0x04;

/// Samples per AAC frame
const AAC_FRAME_SAMPLES: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Elementary {
    H264,
    Aac,
    Mp3,
}

#[derive(Debug, Default)]
struct PesBuffer {
    data: BytesMut,
    /// Total size including the 6-byte prefix, when the header states it
    expected: Option<usize>,
}

struct Pes<'a> {
    pts: Option<u64>,
    dts: Option<u64>,
    payload: &'a [u8],
}

/// Single-program TS demuxer
///
/// Accepts bytes in arbitrary slices and resynchronises on the sync byte.
#[derive(Debug, Default)]
pub struct TsReader {
    pending: BytesMut,
    pmt_pid: Option<u16>,
    streams: HashMap<u16, Elementary>,
    pes: HashMap<u16, PesBuffer>,
    parameter_sets: Option<(Bytes, Bytes)>,
    aac: Option<AacConfig>,
}

impl TsReader {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_packet(&mut self, packet: &[u8], events: &mut Vec<MediaEvent>) {
        let unit_start = packet[1] & 0x40 != 0;
        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let control = (packet[3] >> 4) & 0x03;
        if control & 0x01 == 0 {
            return;
        }
        let start = if control & 0x02 != 0 {
            5 + packet[4] as usize
        } else {
            4
        };
        let Some(payload) = packet.get(start..) else {
            return;
        };
        if payload.is_empty() {
            return;
        }

        if pid == PAT_PID {
            if unit_start {
                if let Err(e) = self.parse_pat(payload) {
                    tracing::debug!(error = %e, "PAT ignored");
                }
            }
        } else if Some(pid) == self.pmt_pid {
            if unit_start {
                if let Err(e) = self.parse_pmt(payload) {
                    tracing::debug!(error = %e, "PMT ignored");
                }
            }
        } else if self.streams.contains_key(&pid) {
            self.handle_pes_payload(pid, unit_start, payload, events);
        }
    }

    fn handle_pes_payload(
        &mut self,
        pid: u16,
        unit_start: bool,
        payload: &[u8],
        events: &mut Vec<MediaEvent>,
    ) {
        if unit_start {
            if let Some(previous) = self.pes.remove(&pid) {
                self.finish_pes(pid, previous, events);
            }
            let expected = match payload.get(4..6) {
                Some(&[hi, lo]) => match u16::from_be_bytes([hi, lo]) {
                    0 => None,
                    len => Some(len as usize + 6),
                },
                _ => None,
            };
            self.pes.insert(
                pid,
                PesBuffer {
                    data: BytesMut::from(payload),
                    expected,
                },
            );
        } else if let Some(buffer) = self.pes.get_mut(&pid) {
            buffer.data.extend_from_slice(payload);
        } else {
            // Joined mid-PES
            return;
        }

        let complete = self
            .pes
            .get(&pid)
            .and_then(|b| b.expected.map(|expected| b.data.len() >= expected))
            .unwrap_or(false);
        if complete {
            if let Some(buffer) = self.pes.remove(&pid) {
                self.finish_pes(pid, buffer, events);
            }
        }
    }

    fn parse_pat(&mut self, payload: &[u8]) -> Result<(), TsError> {
        let section = section(payload)?;
        let programs = section.get(8..section.len() - 4).unwrap_or_default();
        for entry in programs.chunks_exact(4) {
            let program = u16::from_be_bytes([entry[0], entry[1]]);
            if program != 0 {
                let pid = ((entry[2] as u16 & 0x1F) << 8) | entry[3] as u16;
                if self.pmt_pid != Some(pid) {
                    tracing::debug!(pid, "PMT PID found");
                    self.pmt_pid = Some(pid);
                }
                break;
            }
        }
        Ok(())
    }

    fn parse_pmt(&mut self, payload: &[u8]) -> Result<(), TsError> {
        let section = section(payload)?;
        if section.len() < 16 {
            return Err(TsError::TruncatedSection);
        }
        let info_len = (((section[10] & 0x0F) as usize) << 8) | section[11] as usize;
        let end = section.len() - 4;
        let mut pos = 12 + info_len;

        let mut streams = HashMap::new();
        while pos + 5 <= end {
            let stream_type = section[pos];
            let pid = ((section[pos + 1] as u16 & 0x1F) << 8) | section[pos + 2] as u16;
            let es_info_len =
                (((section[pos + 3] & 0x0F) as usize) << 8) | section[pos + 4] as usize;
            let kind = match stream_type {
                STREAM_TYPE_H264 => Some(Elementary::H264),
                STREAM_TYPE_AAC => Some(Elementary::Aac),
                STREAM_TYPE_MP3 | STREAM_TYPE_MP3_LSF => Some(Elementary::Mp3),
                _ => None,
            };
            match kind {
                Some(kind) => {
                    streams.insert(pid, kind);
                }
                None => tracing::debug!(pid, stream_type, "unsupported elementary stream ignored"),
            }
            pos += 5 + es_info_len;
        }

        if streams != self.streams {
            tracing::debug!(?streams, "PMT updated");
            self.pes.retain(|pid, _| streams.contains_key(pid));
            self.streams = streams;
        }
        Ok(())
    }

    fn finish_pes(&mut self, pid: u16, buffer: PesBuffer, events: &mut Vec<MediaEvent>) {
        let Some(&kind) = self.streams.get(&pid) else {
            return;
        };
        let pes = match parse_pes(&buffer.data) {
            Ok(pes) => pes,
            Err(e) => {
                tracing::debug!(pid, error = %e, "PES dropped");
                return;
            }
        };
        match kind {
            Elementary::H264 => self.emit_video(&pes, events),
            Elementary::Aac => self.emit_aac(&pes, events),
            Elementary::Mp3 => {
                let time_ms = ticks_to_ms(pes.pts.unwrap_or(0));
                events.push(MediaEvent::Audio {
                    track: 0,
                    tag: AudioTag::new(AudioCodec::Mp3, time_ms),
                    payload: Bytes::copy_from_slice(pes.payload),
                });
            }
        }
    }

    fn emit_video(&mut self, pes: &Pes<'_>, events: &mut Vec<MediaEvent>) {
        let dts = pes.dts.or(pes.pts).unwrap_or(0);
        let pts = pes.pts.unwrap_or(dts);
        let time_ms = ticks_to_ms(dts);
        let composition_offset = ((pts as i64 - dts as i64) / TICKS_PER_MS as i64) as i32;

        let mut sps = None;
        let mut pps = None;
        let mut key = false;
        let mut frame = BytesMut::with_capacity(pes.payload.len() + 16);
        for nal in avc::annexb_units(pes.payload) {
            match avc::nal_type(nal) {
                Some(NAL_SPS) => sps = Some(nal),
                Some(NAL_PPS) => pps = Some(nal),
                Some(NAL_AUD) => {}
                Some(kind) => {
                    key |= kind == NAL_IDR;
                    avc::put_avcc(&mut frame, nal);
                }
                None => {}
            }
        }

        if let (Some(sps), Some(pps)) = (sps, pps) {
            let changed = match &self.parameter_sets {
                Some((known_sps, known_pps)) => known_sps != sps || known_pps != pps,
                None => true,
            };
            if changed {
                let sps = Bytes::copy_from_slice(sps);
                let pps = Bytes::copy_from_slice(pps);
                events.push(MediaEvent::Video {
                    track: 0,
                    tag: VideoTag::new(VideoCodec::H264, FrameType::Config, time_ms),
                    payload: avc::build_decoder_config(&sps, &pps),
                });
                self.parameter_sets = Some((sps, pps));
            }
        }

        if !frame.is_empty() {
            let kind = if key { FrameType::Key } else { FrameType::Inter };
            events.push(MediaEvent::Video {
                track: 0,
                tag: VideoTag {
                    codec: VideoCodec::H264,
                    frame: kind,
                    time_ms,
                    composition_offset,
                },
                payload: frame.freeze(),
            });
        }
    }

    fn emit_aac(&mut self, pes: &Pes<'_>, events: &mut Vec<MediaEvent>) {
        let base = pes.pts.unwrap_or(0);
        let mut data = pes.payload;
        let mut index = 0u64;
        while !data.is_empty() {
            let (config, header_len, frame_len) = match AacConfig::parse_adts(data) {
                Ok(header) => header,
                Err(e) => {
                    tracing::debug!(error = %e, "rest of AAC PES dropped");
                    break;
                }
            };
            let Some(raw) = data.get(header_len..frame_len) else {
                tracing::debug!(frame_len, available = data.len(), "truncated ADTS frame dropped");
                break;
            };

            let rate = config.sample_rate();
            let channels = config.channel_config;
            let offset = index * AAC_FRAME_SAMPLES * 90_000 / rate as u64;
            let time_ms = ticks_to_ms(base + offset);

            if self.aac != Some(config) {
                self.aac = Some(config);
                events.push(MediaEvent::Audio {
                    track: 0,
                    tag: AudioTag {
                        rate,
                        channels,
                        ..AudioTag::config(AudioCodec::Aac, time_ms)
                    },
                    payload: Bytes::copy_from_slice(&config.to_asc()),
                });
            }
            events.push(MediaEvent::Audio {
                track: 0,
                tag: AudioTag {
                    rate,
                    channels,
                    ..AudioTag::new(AudioCodec::Aac, time_ms)
                },
                payload: Bytes::copy_from_slice(raw),
            });

            data = &data[frame_len..];
            index += 1;
        }
    }
}

impl TsDemuxer for TsReader {
    fn read(&mut self, data: &[u8]) -> Vec<MediaEvent> {
        self.pending.extend_from_slice(data);
        let mut events = Vec::new();
        loop {
            match self.pending.iter().position(|b| *b == TS_SYNC_BYTE) {
                Some(0) => {}
                Some(skip) => {
                    tracing::trace!(skip, "TS resync");
                    self.pending.advance(skip);
                }
                None => {
                    self.pending.clear();
                    break;
                }
            }
            if self.pending.len() < TS_PACKET_SIZE {
                break;
            }
            // A sync byte inside a payload is not followed by another packet
            if self.pending.len() > TS_PACKET_SIZE && self.pending[TS_PACKET_SIZE] != TS_SYNC_BYTE {
                self.pending.advance(1);
                continue;
            }
            let packet = self.pending.split_to(TS_PACKET_SIZE);
            self.handle_packet(&packet, &mut events);
        }
        events
    }

    fn flush(&mut self) -> Vec<MediaEvent> {
        let mut events = Vec::new();
        let mut pids: Vec<u16> = self.pes.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            if let Some(buffer) = self.pes.remove(&pid) {
                self.finish_pes(pid, buffer, &mut events);
            }
        }
        events.push(MediaEvent::End);
        *self = Self::new();
        events
    }
}

/// PSI section following the pointer field, checked against its CRC
fn section(payload: &[u8]) -> Result<&[u8], TsError> {
    let pointer = *payload.first().ok_or(TsError::TruncatedSection)? as usize;
    let section = payload.get(1 + pointer..).ok_or(TsError::TruncatedSection)?;
    if section.len() < 3 {
        return Err(TsError::TruncatedSection);
    }
    let length = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
    let section = section
        .get(..3 + length)
        .ok_or(TsError::TruncatedSection)?;
    if section.len() < 12 {
        return Err(TsError::TruncatedSection);
    }
    if crc32_mpeg2(section) != 0 {
        return Err(TsError::BadCrc);
    }
    Ok(section)
}

fn parse_pes(data: &[u8]) -> Result<Pes<'_>, TsError> {
    if data.len() < 3 || data[..3] != [0x00, 0x00, 0x01] {
        return Err(TsError::NotPes);
    }
    if data.len() < 9 {
        return Err(TsError::TruncatedPes);
    }
    let flags = data[7];
    let header_end = 9 + data[8] as usize;
    let stated = u16::from_be_bytes([data[4], data[5]]) as usize;
    let end = if stated == 0 {
        data.len()
    } else {
        (stated + 6).min(data.len())
    };
    if header_end > end {
        return Err(TsError::TruncatedPes);
    }

    let pts = if flags & 0x80 != 0 {
        Some(read_timestamp(data.get(9..14).ok_or(TsError::TruncatedPes)?))
    } else {
        None
    };
    let dts = if flags & 0xC0 == 0xC0 {
        Some(read_timestamp(data.get(14..19).ok_or(TsError::TruncatedPes)?))
    } else {
        None
    };

    Ok(Pes {
        pts,
        dts,
        payload: &data[header_end..end],
    })
}

fn read_timestamp(b: &[u8]) -> u64 {
    (((b[0] as u64 >> 1) & 0x07) << 30)
        | ((b[1] as u64) << 22)
        | (((b[2] as u64) >> 1) << 15)
        | ((b[3] as u64) << 7)
        | ((b[4] as u64) >> 1)
}

fn ticks_to_ms(ticks: u64) -> u32 {
    (ticks / TICKS_PER_MS) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::{TsMuxer, TsWriter};

    const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x1E, 0x95];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];

    fn frame(nals: &[&[u8]]) -> Bytes {
        let mut out = BytesMut::new();
        for nal in nals {
            avc::put_avcc(&mut out, nal);
        }
        out.freeze()
    }

    fn sample_stream() -> BytesMut {
        let mut writer = TsWriter::new();
        let mut out = BytesMut::new();
        writer.begin(&mut out);
        writer.write_video(
            0,
            &VideoTag::new(VideoCodec::H264, FrameType::Config, 0),
            &avc::build_decoder_config(SPS, PPS),
            &mut out,
        );
        writer.write_audio(0, &AudioTag::config(AudioCodec::Aac, 0), &[0x12, 0x10], &mut out);
        writer.write_video(
            0,
            &VideoTag::new(VideoCodec::H264, FrameType::Key, 0),
            &frame(&[&[0x65; 500]]),
            &mut out,
        );
        writer.write_audio(0, &AudioTag::new(AudioCodec::Aac, 10), &[0x21; 200], &mut out);
        writer.write_video(
            0,
            &VideoTag {
                composition_offset: 40,
                ..VideoTag::new(VideoCodec::H264, FrameType::Inter, 40)
            },
            &frame(&[&[0x41; 300]]),
            &mut out,
        );
        out
    }

    #[test]
    fn test_reads_back_writer_output() {
        let stream = sample_stream();
        let mut reader = TsReader::new();
        let mut events = reader.read(&stream);
        events.extend(reader.flush());

        // Video PES are unbounded and complete on the next unit start, so the
        // sized audio PES overtakes the key frame
        let summary: Vec<String> = events.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            summary,
            vec![
                "audio Aac config t=10 (2 bytes)",
                "audio Aac t=10 (200 bytes)",
                "video H264 Config t=0 (20 bytes)",
                "video H264 Key t=0 (504 bytes)",
                "video H264 Inter t=40 (304 bytes)",
                "end",
            ]
        );

        let MediaEvent::Video { tag, .. } = &events[4] else {
            panic!("expected video");
        };
        assert_eq!(tag.composition_offset, 40);
    }

    #[test]
    fn test_arbitrary_chunking_and_garbage() {
        let stream = sample_stream();
        let mut whole = TsReader::new();
        let mut expected = whole.read(&stream);
        expected.extend(whole.flush());

        let mut noisy = vec![0x00, 0x47, 0x13];
        noisy.extend_from_slice(&stream);
        let mut reader = TsReader::new();
        let mut events = Vec::new();
        for chunk in noisy.chunks(100) {
            events.extend(reader.read(chunk));
        }
        events.extend(reader.flush());
        assert_eq!(events, expected);
    }

    #[test]
    fn test_flush_resets_state() {
        let mut reader = TsReader::new();
        assert_eq!(reader.flush(), vec![MediaEvent::End]);

        let stream = sample_stream();
        reader.read(&stream[..stream.len() / 2]);
        let events = reader.flush();
        assert_eq!(events.last(), Some(&MediaEvent::End));

        // Without tables the second half is not decodable
        let events = reader.read(&stream[stream.len() / 2..]);
        assert!(events.is_empty());
        assert_eq!(reader.flush(), vec![MediaEvent::End]);
    }

    #[test]
    fn test_pes_timestamps() {
        let mut pes = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0xC0, 10];
        // PTS 0x1_2345_6789 and DTS 90000
        for (prefix, ts) in [(0x3u64, 0x1_2345_6789u64), (0x1, 90_000)] {
            pes.push(((prefix << 4) | (((ts >> 30) & 0x07) << 1) | 1) as u8);
            pes.extend_from_slice(&(((((ts >> 15) & 0x7FFF) << 1) | 1) as u16).to_be_bytes());
            pes.extend_from_slice(&((((ts & 0x7FFF) << 1) | 1) as u16).to_be_bytes());
        }
        pes.extend_from_slice(b"payload");

        let parsed = parse_pes(&pes).unwrap();
        assert_eq!(parsed.pts, Some(0x1_2345_6789));
        assert_eq!(parsed.dts, Some(90_000));
        assert_eq!(parsed.payload, b"payload");
        assert!(matches!(parse_pes(b"\x00\x00\x02"), Err(TsError::NotPes)));
    }
}
