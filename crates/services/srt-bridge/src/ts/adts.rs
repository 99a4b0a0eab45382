//! AAC AudioSpecificConfig and ADTS framing

use bytes::{BufMut, BytesMut};

use super::TsError;

pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

const ADTS_HEADER_LEN: usize = 7;

/// The part of an AudioSpecificConfig that ADTS can express
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AacConfig {
    /// Audio object type, 1..=4 (2 is AAC-LC)
    pub object_type: u8,
    pub frequency_index: u8,
    pub channel_config: u8,
}

impl AacConfig {
    /// Parse the first two bytes of an AudioSpecificConfig
    pub fn parse(asc: &[u8]) -> Result<Self, TsError> {
        let [b0, b1, ..] = asc else {
            return Err(TsError::UnsupportedAac(format!("{} byte config", asc.len())));
        };
        let config = Self {
            object_type: b0 >> 3,
            frequency_index: ((b0 & 0x07) << 1) | (b1 >> 7),
            channel_config: (b1 >> 3) & 0x0F,
        };
        config.validate()?;
        Ok(config)
    }

    /// AAC-LC config for a rate and channel count, used when the stream never
    /// sent a config frame
    pub fn from_rate(rate: u32, channels: u8) -> Result<Self, TsError> {
        let frequency_index = SAMPLE_RATES
            .iter()
            .position(|r| *r == rate)
            .ok_or_else(|| TsError::UnsupportedAac(format!("sample rate {rate}")))?;
        let config = Self {
            object_type: 2,
            frequency_index: frequency_index as u8,
            channel_config: channels,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), TsError> {
        if !(1..=4).contains(&self.object_type) {
            return Err(TsError::UnsupportedAac(format!(
                "object type {}",
                self.object_type
            )));
        }
        if self.frequency_index as usize >= SAMPLE_RATES.len() {
            return Err(TsError::UnsupportedAac(format!(
                "frequency index {}",
                self.frequency_index
            )));
        }
        if self.channel_config > 7 {
            return Err(TsError::UnsupportedAac(format!(
                "channel config {}",
                self.channel_config
            )));
        }
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATES[self.frequency_index as usize]
    }

    pub fn to_asc(&self) -> [u8; 2] {
        [
            (self.object_type << 3) | (self.frequency_index >> 1),
            ((self.frequency_index & 0x01) << 7) | (self.channel_config << 3),
        ]
    }

    /// Append a 7-byte ADTS header for a raw frame of `payload_len` bytes
    pub fn put_adts_header(&self, payload_len: usize, out: &mut BytesMut) {
        let frame_len = payload_len + ADTS_HEADER_LEN;
        out.put_u8(0xFF);
        out.put_u8(0xF1);
        out.put_u8(
            ((self.object_type - 1) << 6)
                | (self.frequency_index << 2)
                | (self.channel_config >> 2),
        );
        out.put_u8(((self.channel_config & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03));
        out.put_u8((frame_len >> 3) as u8);
        out.put_u8((((frame_len & 0x07) as u8) << 5) | 0x1F);
        out.put_u8(0xFC);
    }

    /// Parse the ADTS header at the start of `data`
    ///
    /// Returns the config, the header length and the full frame length.
    pub fn parse_adts(data: &[u8]) -> Result<(Self, usize, usize), TsError> {
        if data.len() < ADTS_HEADER_LEN || data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
            return Err(TsError::BadAdts);
        }
        let header_len = if data[1] & 0x01 == 1 { 7 } else { 9 };
        let config = Self {
            object_type: (data[2] >> 6) + 1,
            frequency_index: (data[2] >> 2) & 0x0F,
            channel_config: ((data[2] & 0x01) << 2) | (data[3] >> 6),
        };
        config.validate().map_err(|_| TsError::BadAdts)?;
        let frame_len = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] as usize) >> 5);
        if frame_len < header_len {
            return Err(TsError::BadAdts);
        }
        Ok((config, header_len, frame_len))
    }
}
