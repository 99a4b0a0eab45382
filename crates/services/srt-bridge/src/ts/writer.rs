use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use super::adts::AacConfig;
use super::{
    crc32_mpeg2, TsMuxer, AUDIO_PID, PAT_PID, PMT_PID, STREAM_TYPE_AAC, STREAM_TYPE_H264,
    STREAM_TYPE_MP3, TICKS_PER_MS, TS_PACKET_SIZE, TS_SYNC_BYTE, VIDEO_PID,
};
use crate::avc::{self, AvcConfig, NAL_AUD, NAL_SPS};
use crate::media::{AudioCodec, AudioTag, FrameType, VideoCodec, VideoTag};

const STREAM_ID_AUDIO: u8 = 0xC0;
const STREAM_ID_VIDEO: u8 = 0xE0;
const TIMESTAMP_MASK: u64 = (1 << 33) - 1;
const ACCESS_UNIT_DELIMITER: [u8; 2] = [NAL_AUD, 0xF0];

/// Single-program TS muxer
#[derive(Debug)]
pub struct TsWriter {
    continuity: HashMap<u16, u8>,
    audio_stream_type: u8,
    aac: Option<AacConfig>,
    avc: Option<AvcConfig>,
}

impl Default for TsWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl TsWriter {
    pub fn new() -> Self {
        Self {
            continuity: HashMap::new(),
            audio_stream_type: STREAM_TYPE_AAC,
            aac: None,
            avc: None,
        }
    }

    fn next_continuity(&mut self, pid: u16) -> u8 {
        let counter = self.continuity.entry(pid).or_insert(0);
        let current = *counter;
        *counter = (current + 1) & 0x0F;
        current
    }

    fn write_tables(&mut self, out: &mut BytesMut) {
        let mut pat = BytesMut::with_capacity(16);
        pat.put_u8(0x00);
        pat.put_u16(0xB000 | 13);
        pat.put_u16(0x0001);
        pat.put_u8(0xC1);
        pat.put_u8(0x00);
        pat.put_u8(0x00);
        pat.put_u16(0x0001);
        pat.put_u16(0xE000 | PMT_PID);
        pat.put_u32(crc32_mpeg2(&pat));
        self.write_section(PAT_PID, &pat, out);

        let streams = [
            (STREAM_TYPE_H264, VIDEO_PID),
            (self.audio_stream_type, AUDIO_PID),
        ];
        let mut pmt = BytesMut::with_capacity(32);
        pmt.put_u8(0x02);
        pmt.put_u16(0xB000 | (9 + 5 * streams.len() as u16 + 4));
        pmt.put_u16(0x0001);
        pmt.put_u8(0xC1);
        pmt.put_u8(0x00);
        pmt.put_u8(0x00);
        pmt.put_u16(0xE000 | VIDEO_PID);
        pmt.put_u16(0xF000);
        for (stream_type, pid) in streams {
            pmt.put_u8(stream_type);
            pmt.put_u16(0xE000 | pid);
            pmt.put_u16(0xF000);
        }
        pmt.put_u32(crc32_mpeg2(&pmt));
        self.write_section(PMT_PID, &pmt, out);
    }

    fn write_section(&mut self, pid: u16, section: &[u8], out: &mut BytesMut) {
        let cc = self.next_continuity(pid);
        out.put_u8(TS_SYNC_BYTE);
        out.put_u16(0x4000 | pid);
        out.put_u8(0x10 | cc);
        out.put_u8(0x00);
        out.put_slice(section);
        out.put_bytes(0xFF, TS_PACKET_SIZE - 5 - section.len());
    }

    fn write_pes(
        &mut self,
        pid: u16,
        stream_id: u8,
        pts: u64,
        dts: Option<u64>,
        pcr: Option<u64>,
        es: &[u8],
        out: &mut BytesMut,
    ) {
        let header_len = if dts.is_some() { 10 } else { 5 };
        let mut pes = BytesMut::with_capacity(9 + header_len + es.len());
        pes.put_slice(&[0x00, 0x00, 0x01, stream_id]);
        let length = 3 + header_len + es.len();
        if stream_id == STREAM_ID_VIDEO || length > u16::MAX as usize {
            pes.put_u16(0);
        } else {
            pes.put_u16(length as u16);
        }
        pes.put_u8(0x80);
        match dts {
            Some(dts) => {
                pes.put_u8(0xC0);
                pes.put_u8(header_len as u8);
                put_timestamp(&mut pes, 0x3, pts);
                put_timestamp(&mut pes, 0x1, dts);
            }
            None => {
                pes.put_u8(0x80);
                pes.put_u8(header_len as u8);
                put_timestamp(&mut pes, 0x2, pts);
            }
        }
        pes.put_slice(es);

        let mut rest = &pes[..];
        let mut first = true;
        while !rest.is_empty() {
            let cc = self.next_continuity(pid);
            let taken = write_packet(out, pid, first, cc, if first { pcr } else { None }, rest);
            rest = &rest[taken..];
            first = false;
        }
    }

    fn set_audio_stream_type(&mut self, stream_type: u8, out: &mut BytesMut) {
        if self.audio_stream_type != stream_type {
            self.audio_stream_type = stream_type;
            self.write_tables(out);
        }
    }
}

impl TsMuxer for TsWriter {
    fn begin(&mut self, out: &mut BytesMut) {
        self.continuity.clear();
        self.write_tables(out);
    }

    fn write_audio(&mut self, _track: u8, tag: &AudioTag, payload: &[u8], out: &mut BytesMut) {
        let pts = (tag.time_ms as u64 * TICKS_PER_MS) & TIMESTAMP_MASK;
        match tag.codec {
            AudioCodec::Aac => {
                if tag.is_config {
                    match AacConfig::parse(payload) {
                        Ok(config) => self.aac = Some(config),
                        Err(e) => tracing::warn!(error = %e, "AAC config ignored"),
                    }
                    return;
                }
                let config = match self.aac {
                    Some(config) => config,
                    None => match AacConfig::from_rate(tag.rate, tag.channels) {
                        Ok(config) => config,
                        Err(e) => {
                            tracing::debug!(error = %e, "AAC frame skipped, no usable config");
                            return;
                        }
                    },
                };
                self.set_audio_stream_type(STREAM_TYPE_AAC, out);
                let mut es = BytesMut::with_capacity(7 + payload.len());
                config.put_adts_header(payload.len(), &mut es);
                es.put_slice(payload);
                self.write_pes(AUDIO_PID, STREAM_ID_AUDIO, pts, None, None, &es, out);
            }
            AudioCodec::Mp3 => {
                self.set_audio_stream_type(STREAM_TYPE_MP3, out);
                self.write_pes(AUDIO_PID, STREAM_ID_AUDIO, pts, None, None, payload, out);
            }
            codec => tracing::debug!(?codec, "audio codec not supported in TS, frame skipped"),
        }
    }

    fn write_video(&mut self, _track: u8, tag: &VideoTag, payload: &[u8], out: &mut BytesMut) {
        if tag.codec != VideoCodec::H264 {
            tracing::debug!(codec = ?tag.codec, "video codec not supported in TS, frame skipped");
            return;
        }

        if tag.frame == FrameType::Config {
            match avc::parse_decoder_config(payload) {
                Ok(config) => self.avc = Some(config),
                Err(e) => tracing::warn!(error = %e, "H.264 config ignored"),
            }
            return;
        }

        let key = tag.frame == FrameType::Key;
        if key {
            self.write_tables(out);
        }

        let mut es = BytesMut::with_capacity(payload.len() + 64);
        avc::put_annexb(&mut es, &ACCESS_UNIT_DELIMITER);
        if key && !avc::avcc_units(payload).any(|nal| avc::nal_type(nal) == Some(NAL_SPS)) {
            if let Some(config) = &self.avc {
                avc::put_annexb(&mut es, &config.sps);
                avc::put_annexb(&mut es, &config.pps);
            }
        }
        for nal in avc::avcc_units(payload) {
            if avc::nal_type(nal) != Some(NAL_AUD) {
                avc::put_annexb(&mut es, nal);
            }
        }

        let dts = (tag.time_ms as u64 * TICKS_PER_MS) & TIMESTAMP_MASK;
        let pts_ms = (tag.time_ms as i64 + tag.composition_offset as i64).max(0) as u64;
        let pts = (pts_ms * TICKS_PER_MS) & TIMESTAMP_MASK;
        let dts_field = (tag.composition_offset != 0).then_some(dts);
        self.write_pes(VIDEO_PID, STREAM_ID_VIDEO, pts, dts_field, Some(dts), &es, out);
    }

    fn end(&mut self, _out: &mut BytesMut) {
        self.continuity.clear();
        self.audio_stream_type = STREAM_TYPE_AAC;
        self.aac = None;
        self.avc = None;
    }
}

/// 33-bit timestamp with its 4-bit prefix and marker bits
fn put_timestamp(out: &mut BytesMut, prefix: u8, ts: u64) {
    out.put_u8((prefix << 4) | (((ts >> 30) & 0x07) as u8) << 1 | 1);
    out.put_u16(((((ts >> 15) & 0x7FFF) as u16) << 1) | 1);
    out.put_u16((((ts & 0x7FFF) as u16) << 1) | 1);
}

/// Write one TS packet carrying the head of `payload`; returns the bytes taken
fn write_packet(
    out: &mut BytesMut,
    pid: u16,
    unit_start: bool,
    cc: u8,
    pcr: Option<u64>,
    payload: &[u8],
) -> usize {
    let min_adaptation = if pcr.is_some() { 8 } else { 0 };
    let space = TS_PACKET_SIZE - 4 - min_adaptation;
    let taken = payload.len().min(space);
    let stuffing = space - taken;

    let adaptation = pcr.is_some() || stuffing > 0;
    out.put_u8(TS_SYNC_BYTE);
    out.put_u16((if unit_start { 0x4000 } else { 0 }) | pid);
    out.put_u8((if adaptation { 0x30 } else { 0x10 }) | cc);

    match pcr {
        Some(base) => {
            out.put_u8((7 + stuffing) as u8);
            out.put_u8(0x10);
            out.put_u32((base >> 1) as u32);
            out.put_u8((((base & 1) as u8) << 7) | 0x7E);
            out.put_u8(0x00);
            out.put_bytes(0xFF, stuffing);
        }
        None if stuffing == 1 => out.put_u8(0),
        None if stuffing > 1 => {
            out.put_u8((stuffing - 1) as u8);
            out.put_u8(0x00);
            out.put_bytes(0xFF, stuffing - 2);
        }
        None => {}
    }

    out.put_slice(&payload[..taken]);
    taken
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(data: &[u8]) -> Vec<&[u8]> {
        assert_eq!(data.len() % TS_PACKET_SIZE, 0);
        data.chunks(TS_PACKET_SIZE).collect()
    }

    fn pid(packet: &[u8]) -> u16 {
        ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16
    }

    #[test]
    fn test_begin_writes_pat_and_pmt() {
        let mut writer = TsWriter::new();
        let mut out = BytesMut::new();
        writer.begin(&mut out);

        let packets = packets(&out);
        assert_eq!(packets.len(), 2);
        assert_eq!(pid(packets[0]), PAT_PID);
        assert_eq!(pid(packets[1]), PMT_PID);

        // Section CRC over table_id..crc is zero
        let pat = &packets[0][5..5 + 16];
        assert_eq!(crc32_mpeg2(pat), 0);
        let pmt = &packets[1][5..5 + 26];
        assert_eq!(crc32_mpeg2(pmt), 0);
    }

    #[test]
    fn test_key_frame_repeats_tables_and_carries_pcr() {
        let mut writer = TsWriter::new();
        let mut out = BytesMut::new();
        writer.write_video(
            0,
            &VideoTag::new(VideoCodec::H264, FrameType::Config, 0),
            &avc::build_decoder_config(&[0x67, 0x42, 0, 0x1E], &[0x68, 0xCE]),
            &mut out,
        );
        assert!(out.is_empty());

        let mut frame = BytesMut::new();
        avc::put_avcc(&mut frame, &[0x65; 400]);
        writer.write_video(
            0,
            &VideoTag::new(VideoCodec::H264, FrameType::Key, 40),
            &frame,
            &mut out,
        );

        let packets = packets(&out);
        assert_eq!(pid(packets[0]), PAT_PID);
        assert_eq!(pid(packets[1]), PMT_PID);
        assert_eq!(pid(packets[2]), VIDEO_PID);
        // Unit start with adaptation field carrying a PCR
        assert_eq!(packets[2][1] & 0x40, 0x40);
        assert_eq!(packets[2][3] & 0x30, 0x30);
        assert_eq!(packets[2][5] & 0x10, 0x10);
        // Continuity counter advances per PID
        assert_eq!(packets[3][3] & 0x0F, 1);
    }

    #[test]
    fn test_audio_without_config_is_skipped() {
        let mut writer = TsWriter::new();
        let mut out = BytesMut::new();
        writer.write_audio(0, &AudioTag::new(AudioCodec::Aac, 0), &[1, 2, 3], &mut out);
        assert!(out.is_empty());

        writer.write_audio(
            0,
            &AudioTag::new(AudioCodec::Opus, 0),
            &[1, 2, 3],
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_short_payload_is_stuffed() {
        let mut out = BytesMut::new();
        let taken = write_packet(&mut out, AUDIO_PID, true, 0, None, &[0xAB; 10]);
        assert_eq!(taken, 10);
        assert_eq!(out.len(), TS_PACKET_SIZE);
        assert_eq!(out[4] as usize, TS_PACKET_SIZE - 4 - 10 - 1);
        assert_eq!(&out[TS_PACKET_SIZE - 10..], &[0xAB; 10]);
    }

    #[test]
    fn test_end_forgets_codec_state() {
        let mut writer = TsWriter::new();
        let mut out = BytesMut::new();
        writer.write_audio(
            0,
            &AudioTag::config(AudioCodec::Aac, 0),
            &[0x12, 0x10],
            &mut out,
        );
        writer.end(&mut out);
        assert!(out.is_empty());

        writer.write_audio(0, &AudioTag::new(AudioCodec::Aac, 20), &[1, 2], &mut out);
        assert!(out.is_empty());
    }
}
