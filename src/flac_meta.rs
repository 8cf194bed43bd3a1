//! Manual parsing of the FLAC `STREAMINFO` metadata block.
//!
//! We parse this ourselves, rather than pulling it from `symphonia`, because
//! the drivers only need `sample_rate`/`total_samples` for duration
//! estimation and `symphonia`'s probe is significantly more machinery than a
//! fixed-offset read of one metadata block requires.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlacMetaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid FLAC signature")]
    BadSignature,
    #[error("STREAMINFO block not found")]
    NoStreamInfo,
    #[error("truncated metadata block")]
    Truncated,
}

/// Decoded `STREAMINFO` fields relevant to duration estimation and
/// per-track header correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub total_samples: u64,
}

impl StreamInfo {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.total_samples * 1000) / self.sample_rate as u64
    }
}

/// Everything a caller needs from the header region of a FLAC file.
#[derive(Debug, Clone, Copy)]
pub struct FlacHeaders {
    pub stream_info: StreamInfo,
}

/// Read and parse the header region of a FLAC file.
pub fn read_headers(flac_path: &Path) -> Result<FlacHeaders, FlacMetaError> {
    let file_data = std::fs::read(flac_path)?;
    let stream_info = parse_stream_info(&file_data)?;
    Ok(FlacHeaders { stream_info })
}

fn parse_stream_info(headers: &[u8]) -> Result<StreamInfo, FlacMetaError> {
    if headers.len() < 4 || &headers[0..4] != b"fLaC" {
        return Err(FlacMetaError::BadSignature);
    }

    let mut pos = 4usize;
    loop {
        if pos + 4 > headers.len() {
            return Err(FlacMetaError::NoStreamInfo);
        }
        let header = u32::from_be_bytes([
            headers[pos],
            headers[pos + 1],
            headers[pos + 2],
            headers[pos + 3],
        ]);
        let is_last = (header & 0x8000_0000) != 0;
        let block_type = (header >> 24) & 0x7F;
        let block_size = (header & 0x00FF_FFFF) as usize;
        pos += 4;

        if block_type == 0 {
            if pos + 34 > headers.len() {
                return Err(FlacMetaError::Truncated);
            }

            let sample_rate = (u32::from_be_bytes([0, headers[pos + 10], headers[pos + 11], headers[pos + 12]]) >> 4)
                & 0xF_FFFF;
            let channels = ((headers[pos + 12] >> 1) & 0x07) as u16 + 1;
            let bits_per_sample =
                (((headers[pos + 12] & 0x01) << 4) | ((headers[pos + 13] >> 4) & 0x0F)) as u16 + 1;

            let total_samples = (((headers[pos + 13] & 0x0F) as u64) << 32)
                | u32::from_be_bytes([headers[pos + 14], headers[pos + 15], headers[pos + 16], headers[pos + 17]])
                    as u64;

            return Ok(StreamInfo {
                sample_rate,
                channels,
                bits_per_sample,
                total_samples,
            });
        }

        pos += block_size;
        if is_last {
            return Err(FlacMetaError::NoStreamInfo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_flac(sample_rate: u32, channels: u16, bits_per_sample: u16, total_samples: u64) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"fLaC");

        // STREAMINFO block, marked last, 34 bytes of payload.
        let header: u32 = 0x8000_0000 | (0u32 << 24) | 34u32;
        data.extend_from_slice(&header.to_be_bytes());

        data.extend_from_slice(&[0u8; 10]); // min/max blocksize + frame size, unused here

        let sample_rate_bits = (sample_rate & 0xF_FFFF) << 4;
        let channels_bits = (((channels - 1) as u32) & 0x07) << 1;
        let bps_high_bit = (((bits_per_sample - 1) as u32) >> 4) & 0x01;
        let word = sample_rate_bits | channels_bits | bps_high_bit;
        data.extend_from_slice(&word.to_be_bytes()[1..4]);

        let bps_low_4 = (((bits_per_sample - 1) as u8) & 0x0F) << 4;
        let total_samples_high_4 = ((total_samples >> 32) & 0x0F) as u8;
        data.push(bps_low_4 | total_samples_high_4);

        let low_32 = (total_samples & 0xFFFF_FFFF) as u32;
        data.extend_from_slice(&low_32.to_be_bytes());

        data.extend_from_slice(&[0u8; 16]); // MD5 signature, unused

        data
    }

    #[test]
    fn round_trips_stream_info_fields() {
        let data = synthetic_flac(44_100, 2, 16, 44_100 * 10);
        let info = parse_stream_info(&data).unwrap();
        assert_eq!(info.sample_rate, 44_100);
        assert_eq!(info.channels, 2);
        assert_eq!(info.bits_per_sample, 16);
        assert_eq!(info.total_samples, 44_100 * 10);
        assert_eq!(info.duration_ms(), 10_000);
    }

    #[test]
    fn rejects_non_flac_signature() {
        let err = parse_stream_info(b"not flac").unwrap_err();
        assert!(matches!(err, FlacMetaError::BadSignature));
    }
}
