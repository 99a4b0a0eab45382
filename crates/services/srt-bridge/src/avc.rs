//! H.264 helpers
//!
//! AVCC framing (length-prefixed NAL units), Annex-B framing (start codes)
//! and the AVCDecoderConfigurationRecord carried by `Config` frames.

use bytes::{BufMut, Bytes, BytesMut};

pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AvcError {
    #[error("decoder configuration too short ({0} bytes)")]
    TooShort(usize),

    #[error("unsupported decoder configuration version {0}")]
    UnsupportedVersion(u8),

    #[error("decoder configuration truncated")]
    Truncated,

    #[error("decoder configuration carries no SPS")]
    MissingSps,

    #[error("decoder configuration carries no PPS")]
    MissingPps,
}

/// Parsed AVCDecoderConfigurationRecord
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    pub nal_length_size: u8,
    /// First sequence parameter set
    pub sps: Bytes,
    /// First picture parameter set
    pub pps: Bytes,
}

pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// Parse an AVCDecoderConfigurationRecord
pub fn parse_decoder_config(payload: &[u8]) -> Result<AvcConfig, AvcError> {
    if payload.len() < 7 {
        return Err(AvcError::TooShort(payload.len()));
    }
    if payload[0] != 1 {
        return Err(AvcError::UnsupportedVersion(payload[0]));
    }

    let profile = payload[1];
    let compatibility = payload[2];
    let level = payload[3];
    let nal_length_size = (payload[4] & 0x03) + 1;

    let mut pos = 5;
    let sps = read_parameter_sets(payload, &mut pos, payload[5] & 0x1F)?
        .ok_or(AvcError::MissingSps)?;
    let count = *payload.get(pos).ok_or(AvcError::MissingPps)?;
    let pps = read_parameter_sets(payload, &mut pos, count)?.ok_or(AvcError::MissingPps)?;

    Ok(AvcConfig {
        profile,
        compatibility,
        level,
        nal_length_size,
        sps,
        pps,
    })
}

/// Read `count` length-prefixed sets after the count byte at `pos`; keeps the first
fn read_parameter_sets(
    payload: &[u8],
    pos: &mut usize,
    count: u8,
) -> Result<Option<Bytes>, AvcError> {
    *pos += 1;
    let mut first = None;
    for _ in 0..count {
        let header = payload.get(*pos..*pos + 2).ok_or(AvcError::Truncated)?;
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        *pos += 2;
        let set = payload.get(*pos..*pos + len).ok_or(AvcError::Truncated)?;
        *pos += len;
        if first.is_none() && !set.is_empty() {
            first = Some(Bytes::copy_from_slice(set));
        }
    }
    Ok(first)
}

/// Build an AVCDecoderConfigurationRecord with 4-byte NAL lengths
pub fn build_decoder_config(sps: &[u8], pps: &[u8]) -> Bytes {
    let (profile, compatibility, level) = match sps {
        [_, profile, compatibility, level, ..] => (*profile, *compatibility, *level),
        _ => (0, 0, 0),
    };

    let mut out = BytesMut::with_capacity(11 + sps.len() + pps.len());
    out.put_u8(1);
    out.put_u8(profile);
    out.put_u8(compatibility);
    out.put_u8(level);
    out.put_u8(0xFF);
    out.put_u8(0xE1);
    out.put_u16(sps.len() as u16);
    out.put_slice(sps);
    out.put_u8(1);
    out.put_u16(pps.len() as u16);
    out.put_slice(pps);
    out.freeze()
}

/// NAL units of an AVCC frame with 4-byte lengths; stops at the first
/// inconsistent length
pub fn avcc_units(frame: &[u8]) -> AvccUnits<'_> {
    AvccUnits { rest: frame }
}

pub struct AvccUnits<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for AvccUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([self.rest[0], self.rest[1], self.rest[2], self.rest[3]])
            as usize;
        let Some(nal) = self.rest.get(4..4 + len) else {
            self.rest = &[];
            return None;
        };
        self.rest = &self.rest[4 + len..];
        Some(nal)
    }
}

/// SPS and PPS embedded in an AVCC frame
pub fn extract_parameter_sets(frame: &[u8]) -> Option<(Bytes, Bytes)> {
    let mut sps = None;
    let mut pps = None;
    for nal in avcc_units(frame) {
        match nal_type(nal) {
            Some(NAL_SPS) if sps.is_none() => sps = Some(nal),
            Some(NAL_PPS) if pps.is_none() => pps = Some(nal),
            _ => {}
        }
    }
    Some((
        Bytes::copy_from_slice(sps?),
        Bytes::copy_from_slice(pps?),
    ))
}

/// NAL units of an Annex-B byte stream
pub fn annexb_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let mut end = match starts.get(n + 1) {
            Some(next) => next - 3,
            None => data.len(),
        };
        // Trailing zeros belong to the next four-byte start code
        while end > start && data[end - 1] == 0 {
            end -= 1;
        }
        if end > start {
            units.push(&data[start..end]);
        }
    }
    units
}

/// Append `nal` with a start code
pub fn put_annexb(out: &mut BytesMut, nal: &[u8]) {
    out.put_slice(&START_CODE);
    out.put_slice(nal);
}

/// Append `nal` with a 4-byte length
pub fn put_avcc(out: &mut BytesMut, nal: &[u8]) {
    out.put_u32(nal.len() as u32);
    out.put_slice(nal);
}
